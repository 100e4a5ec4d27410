use std::sync::Arc;

use mcweb_core::Supervisor;

use crate::identity::IdentityMap;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub identity: Arc<IdentityMap>,
}
