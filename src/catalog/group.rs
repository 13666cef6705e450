use serde::{Deserialize, Serialize};

/// Ownership group a block placement is accounted to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
}

impl Group {

    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}
