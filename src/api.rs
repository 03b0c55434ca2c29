// Resource request builders
//
// Thin, borrow-based views over `CrmHttpClient`. Each method maps one REST
// call; bodies and results are left as JSON for the caller to shape.

use serde_json::Value;

use crate::auth::{LoginRequest, LoginResponse, RefreshRequest, VerifyRequest};
use crate::error::{ClientError, Result};
use crate::http_client::{ApiRequest, CrmHttpClient, MultipartBody};

pub type Query<'q> = &'q [(&'q str, &'q str)];

const AUTH: &str = "crm-api/auth/token";
const CONTACTS: &str = "crm-api/conversations/contacts";
const PROFILES: &str = "crm-api/customer-data/profiles";
const FLOWS: &str = "crm-api/flows/flows";
const META_CONFIGS: &str = "crm-api/meta/api/configs";
const MEDIA_ASSETS: &str = "media/media-assets";

fn to_body<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| ClientError::Internal(format!("Failed to serialize request: {}", e)))
}

impl CrmHttpClient {
    pub fn auth(&self) -> AuthApi<'_> {
        AuthApi { http: self }
    }

    pub fn dashboard(&self) -> DashboardApi<'_> {
        DashboardApi { http: self }
    }

    pub fn contacts(&self) -> ContactsApi<'_> {
        ContactsApi { http: self }
    }

    pub fn profiles(&self) -> ProfilesApi<'_> {
        ProfilesApi { http: self }
    }

    pub fn flows(&self) -> FlowsApi<'_> {
        FlowsApi { http: self }
    }

    pub fn meta(&self) -> MetaApi<'_> {
        MetaApi { http: self }
    }

    pub fn media_assets(&self) -> MediaAssetsApi<'_> {
        MediaAssetsApi { http: self }
    }

    pub fn analytics(&self) -> AnalyticsApi<'_> {
        AnalyticsApi { http: self }
    }

    pub fn saved_data(&self) -> SavedDataApi<'_> {
        SavedDataApi { http: self }
    }
}

/// Token endpoints. None of them go through the refresh path.
pub struct AuthApi<'a> {
    http: &'a CrmHttpClient,
}

impl AuthApi<'_> {
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let body = to_body(&LoginRequest { username, password })?;
        self.http
            .send_json(ApiRequest::post(format!("{}/", AUTH)).json(body).skip_refresh())
            .await
    }

    pub async fn blacklist(&self, refresh: &str) -> Result<()> {
        let body = to_body(&RefreshRequest { refresh })?;
        self.http
            .send(
                ApiRequest::post(format!("{}/blacklist/", AUTH))
                    .json(body)
                    .skip_refresh()
                    .quiet(),
            )
            .await?;
        Ok(())
    }

    /// `Ok(false)` when the backend rejects the token
    pub async fn verify(&self, token: &str) -> Result<bool> {
        let body = to_body(&VerifyRequest { token })?;
        let request = ApiRequest::post(format!("{}/verify/", AUTH))
            .json(body)
            .skip_refresh();
        match self.http.send(request).await {
            Ok(_) => Ok(true),
            Err(e) if e.status() == Some(401) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

pub struct DashboardApi<'a> {
    http: &'a CrmHttpClient,
}

impl DashboardApi<'_> {
    pub async fn summary(&self) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get("crm-api/stats/summary/"))
            .await
    }
}

pub struct ContactsApi<'a> {
    http: &'a CrmHttpClient,
}

impl ContactsApi<'_> {
    pub async fn list(&self, params: Query<'_>) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(format!("{}/", CONTACTS)).query(params))
            .await
    }

    pub async fn retrieve(&self, id: &str) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(format!("{}/{}/", CONTACTS, id)))
            .await
    }

    pub async fn patch(&self, id: &str, data: Value) -> Result<Value> {
        self.http
            .send_value(ApiRequest::patch(format!("{}/{}/", CONTACTS, id)).json(data))
            .await
    }

    pub async fn list_messages(&self, contact_id: &str) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(format!("{}/{}/messages/", CONTACTS, contact_id)))
            .await
    }
}

pub struct ProfilesApi<'a> {
    http: &'a CrmHttpClient,
}

impl ProfilesApi<'_> {
    pub async fn list(&self, params: Query<'_>) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(format!("{}/", PROFILES)).query(params))
            .await
    }

    pub async fn retrieve(&self, id: &str) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(format!("{}/{}/", PROFILES, id)))
            .await
    }

    pub async fn patch(&self, id: &str, data: Value) -> Result<Value> {
        self.http
            .send_value(ApiRequest::patch(format!("{}/{}/", PROFILES, id)).json(data))
            .await
    }
}

/// Flows, their steps, and the transitions between steps
pub struct FlowsApi<'a> {
    http: &'a CrmHttpClient,
}

impl FlowsApi<'_> {
    pub async fn list(&self) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(format!("{}/", FLOWS)))
            .await
    }

    pub async fn retrieve(&self, id: &str) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(format!("{}/{}/", FLOWS, id)))
            .await
    }

    pub async fn create(&self, data: Value) -> Result<Value> {
        self.http
            .send_value(ApiRequest::post(format!("{}/", FLOWS)).json(data))
            .await
    }

    pub async fn update(&self, id: &str, data: Value) -> Result<Value> {
        self.http
            .send_value(ApiRequest::put(format!("{}/{}/", FLOWS, id)).json(data))
            .await
    }

    pub async fn patch(&self, id: &str, data: Value) -> Result<Value> {
        self.http
            .send_value(ApiRequest::patch(format!("{}/{}/", FLOWS, id)).json(data))
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<Value> {
        self.http
            .send_value(ApiRequest::delete(format!("{}/{}/", FLOWS, id)))
            .await
    }

    pub async fn list_steps(&self, flow_id: &str) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(steps_path(flow_id)))
            .await
    }

    pub async fn create_step(&self, flow_id: &str, data: Value) -> Result<Value> {
        self.http
            .send_value(ApiRequest::post(steps_path(flow_id)).json(data))
            .await
    }

    pub async fn patch_step(&self, flow_id: &str, step_id: &str, data: Value) -> Result<Value> {
        self.http
            .send_value(
                ApiRequest::patch(format!("{}{}/", steps_path(flow_id), step_id)).json(data),
            )
            .await
    }

    pub async fn delete_step(&self, flow_id: &str, step_id: &str) -> Result<Value> {
        self.http
            .send_value(ApiRequest::delete(format!("{}{}/", steps_path(flow_id), step_id)))
            .await
    }

    pub async fn list_transitions(&self, flow_id: &str, step_id: &str) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(transitions_path(flow_id, step_id)))
            .await
    }

    pub async fn create_transition(
        &self,
        flow_id: &str,
        step_id: &str,
        data: Value,
    ) -> Result<Value> {
        self.http
            .send_value(ApiRequest::post(transitions_path(flow_id, step_id)).json(data))
            .await
    }

    pub async fn update_transition(
        &self,
        flow_id: &str,
        step_id: &str,
        transition_id: &str,
        data: Value,
    ) -> Result<Value> {
        let path = format!("{}{}/", transitions_path(flow_id, step_id), transition_id);
        self.http
            .send_value(ApiRequest::put(path).json(data))
            .await
    }

    pub async fn delete_transition(
        &self,
        flow_id: &str,
        step_id: &str,
        transition_id: &str,
    ) -> Result<Value> {
        let path = format!("{}{}/", transitions_path(flow_id, step_id), transition_id);
        self.http.send_value(ApiRequest::delete(path)).await
    }
}

fn steps_path(flow_id: &str) -> String {
    format!("{}/{}/steps/", FLOWS, flow_id)
}

fn transitions_path(flow_id: &str, step_id: &str) -> String {
    format!("{}{}/transitions/", steps_path(flow_id), step_id)
}

/// WhatsApp Business API configurations
pub struct MetaApi<'a> {
    http: &'a CrmHttpClient,
}

impl MetaApi<'_> {
    pub async fn configs(&self) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(format!("{}/", META_CONFIGS)))
            .await
    }

    pub async fn create_config(&self, data: Value) -> Result<Value> {
        self.http
            .send_value(ApiRequest::post(format!("{}/", META_CONFIGS)).json(data))
            .await
    }

    pub async fn update_config(&self, id: &str, data: Value) -> Result<Value> {
        self.http
            .send_value(ApiRequest::put(format!("{}/{}/", META_CONFIGS, id)).json(data))
            .await
    }
}

/// Media assets; uploads go out as multipart
pub struct MediaAssetsApi<'a> {
    http: &'a CrmHttpClient,
}

impl MediaAssetsApi<'_> {
    pub async fn list(&self, params: Query<'_>) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(format!("{}/", MEDIA_ASSETS)).query(params))
            .await
    }

    pub async fn retrieve(&self, id: &str) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get(format!("{}/{}/", MEDIA_ASSETS, id)))
            .await
    }

    pub async fn create(&self, form: MultipartBody) -> Result<Value> {
        self.http
            .send_value(ApiRequest::post(format!("{}/", MEDIA_ASSETS)).multipart(form))
            .await
    }

    pub async fn update(&self, id: &str, form: MultipartBody) -> Result<Value> {
        self.http
            .send_value(ApiRequest::patch(format!("{}/{}/", MEDIA_ASSETS, id)).multipart(form))
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<Value> {
        self.http
            .send_value(ApiRequest::delete(format!("{}/{}/", MEDIA_ASSETS, id)))
            .await
    }
}

pub struct AnalyticsApi<'a> {
    http: &'a CrmHttpClient,
}

impl AnalyticsApi<'_> {
    pub async fn reports(&self, params: Query<'_>) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get("crm-api/analytics/reports/").query(params))
            .await
    }
}

pub struct SavedDataApi<'a> {
    http: &'a CrmHttpClient,
}

impl SavedDataApi<'_> {
    pub async fn list(&self) -> Result<Value> {
        self.http
            .send_value(ApiRequest::get("crm-api/saved-data/"))
            .await
    }
}
