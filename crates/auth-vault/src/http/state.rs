use std::sync::Arc;

use crate::config::VaultConfig;
use crate::idp::IdpClient;
use crate::storage::VaultStorage;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn VaultStorage>,
    pub idp: Arc<IdpClient>,
    pub config: Arc<VaultConfig>,
}

impl AppState {
    pub fn new(storage: Arc<dyn VaultStorage>, idp: Arc<IdpClient>, config: Arc<VaultConfig>) -> Self {
        Self { storage, idp, config }
    }
}
