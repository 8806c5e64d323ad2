use std::sync::Arc;

use server_api::ApiContext;

use crate::hub::Hub;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) hub: Arc<Hub>,
}
