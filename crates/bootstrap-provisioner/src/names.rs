//! Resource naming
//!
//! Every resource name derives from the cluster identifier alone, so a later
//! teardown finds exactly what an earlier create made.

/// Names of the hypervisor resources owned by one bootstrap node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapNames {
    pub pool: String,
    pub base_volume: String,
    pub main_volume: String,
    pub ignition_volume: String,
    pub domain: String,
}

impl BootstrapNames {
    pub fn new(cluster_id: &str) -> Self {
        let prefix = format!("{}-bootstrap", cluster_id);
        Self {
            pool: prefix.clone(),
            base_volume: format!("{}-base", prefix),
            main_volume: prefix.clone(),
            ignition_volume: format!("{}.ign", prefix),
            domain: prefix,
        }
    }
}
