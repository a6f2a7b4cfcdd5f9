use anyhow::{format_err, Error};
use serde::{self, Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-cell annotations supplied by the caller. Columns are carried through the analysis
/// untouched and handed back alongside the results, in the same cell order.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CellMetadata {
    pub n_cells: usize,
    #[serde(deserialize_with = "default_if_empty")]
    pub columns: BTreeMap<String, Vec<String>>,
}

impl CellMetadata {
    pub fn new(n_cells: usize) -> CellMetadata {
        CellMetadata {
            n_cells,
            columns: BTreeMap::new(),
        }
    }

    /// Attach a column. Fails if the column length doesn't match the number of cells or the
    /// name is already taken.
    pub fn add_column(&mut self, name: impl Into<String>, values: Vec<String>) -> Result<(), Error> {
        let name = name.into();
        if values.len() != self.n_cells {
            return Err(format_err!(
                "metadata column '{}' has {} values, expected {}",
                name,
                values.len(),
                self.n_cells
            ));
        }
        if self.columns.contains_key(&name) {
            return Err(format_err!("metadata column '{}' already present", name));
        }
        self.columns.insert(name, values);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

pub fn default_if_empty<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::Deserialize<'de> + Default,
{
    Option::<T>::deserialize(de).map(std::option::Option::unwrap_or_default)
}
