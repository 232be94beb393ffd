use serde::{Deserialize, Serialize};

/// Request header carrying the opaque task identifier used to correlate the
/// out-of-band response with the command that triggered it.
pub const TASK_UUID_HEADER: &str = "taskuuid";
/// Request header telling the agent where to POST the eventual response.
pub const CALLBACK_URL_HEADER: &str = "callbackurl";

// Agent endpoint paths. Each is joined under the backend's filesystem-type
// segment, e.g. `http://<host>:<port>/btrfs/bits/checkifexists`.
pub const INIT_PATH: &str = "/init";
pub const CHECK_BITS_EXISTENCE_PATH: &str = "/bits/checkifexists";
pub const DELETE_BITS_PATH: &str = "/bits/delete";
pub const CREATE_ROOT_VOLUME_PATH: &str = "/volumes/createrootfromtemplate";
pub const CREATE_EMPTY_VOLUME_PATH: &str = "/volumes/createempty";
pub const DOWNLOAD_BITS_PATH: &str = "/image/sftp/download";

fn default_success() -> bool {
    true
}

/// Fields present on every agent response. Payload fields of the concrete
/// response types are only meaningful when `success` is true; callers must
/// branch on `success` before reading them.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_capacity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_capacity: Option<u64>,
}

impl Default for AgentResponse {
    fn default() -> Self {
        Self {
            success: true,
            error: None,
            total_capacity: None,
            available_capacity: None,
        }
    }
}

impl AgentResponse {
    /// The agent's error string, or a placeholder when the agent reported
    /// failure without one.
    pub fn error_text(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "agent reported failure without an error message".to_string())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckBitsExistenceCmd {
    pub path: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckBitsExistenceRsp {
    #[serde(flatten)]
    pub base: AgentResponse,
    #[serde(default)]
    pub existing: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadBitsCmd {
    pub backup_storage_install_path: String,
    pub primary_storage_install_path: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadBitsRsp {
    #[serde(flatten)]
    pub base: AgentResponse,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRootVolumeFromTemplateCmd {
    pub install_path: String,
    pub volume_uuid: String,
    pub template_path_in_cache: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chap_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chap_password: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRootVolumeFromTemplateRsp {
    #[serde(flatten)]
    pub base: AgentResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iscsi_path: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEmptyVolumeCmd {
    pub install_path: String,
    pub volume_uuid: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chap_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chap_password: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEmptyVolumeRsp {
    #[serde(flatten)]
    pub base: AgentResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iscsi_path: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBitsCmd {
    pub install_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_uuid: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBitsRsp {
    #[serde(flatten)]
    pub base: AgentResponse,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitCmd {
    pub root_folder_path: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRsp {
    #[serde(flatten)]
    pub base: AgentResponse,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum VolumeType {
    Root,
    Data,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ImageMediaType {
    RootVolumeTemplate,
    DataVolumeTemplate,
    #[serde(rename = "ISO")]
    Iso,
}

/// A volume record as the control plane sees it. `install_path` is absent
/// until the volume has been materialized; on success it carries the
/// synthesized iSCSI protocol address.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInventory {
    pub uuid: String,
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInventory {
    pub uuid: String,
    pub media_type: ImageMediaType,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// The template selection for a root-volume instantiation: the image record
/// plus where its bits live on the selected backup storage.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub inventory: ImageInventory,
    pub backup_storage_install_path: String,
}
