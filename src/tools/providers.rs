use schemars::JsonSchema;
use serde::Deserialize;

use crate::provider::{ProviderConfig, ProviderRole};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProviderRequest {
    /// Full provider record. `id` is ignored when adding.
    pub provider: ProviderConfig,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProviderIdRequest {
    /// Provider id from `providers` output.
    pub id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SetActiveRequest {
    /// `chat` or `fim`.
    pub role: ProviderRole,
    /// Provider id from `providers` output. Unknown ids are ignored.
    pub id: String,
}
