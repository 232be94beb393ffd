//! Deterministic path and address construction. These formats are part of the
//! wire contract with deployed agents and must not drift.

/// URL of an agent endpoint, e.g. `http://ps1:7070/btrfs/bits/checkifexists`.
pub fn agent_url(hostname: &str, port: u16, filesystem_type: &str, endpoint: &str) -> String {
    format!(
        "http://{hostname}:{port}/{}{endpoint}",
        filesystem_type.trim_matches('/')
    )
}

/// Where a template image is staged on the backend.
pub fn image_cache_path(root: &str, image_uuid: &str) -> String {
    join(
        root,
        &format!("imageCache/templates/{image_uuid}/{image_uuid}.template"),
    )
}

pub fn root_volume_path(root: &str, account_uuid: &str, volume_uuid: &str) -> String {
    join(
        root,
        &format!("rootVolumes/acct-{account_uuid}/vol-{volume_uuid}/{volume_uuid}.img"),
    )
}

pub fn data_volume_path(root: &str, account_uuid: &str, volume_uuid: &str) -> String {
    join(
        root,
        &format!("dataVolumes/acct-{account_uuid}/vol-{volume_uuid}/{volume_uuid}.img"),
    )
}

/// The client-facing iSCSI address for a provisioned volume, built from the
/// backend identity and the target returned by the agent.
pub fn iscsi_volume_path(backend_uuid: &str, target: &str) -> String {
    format!("iscsi://ip-{backend_uuid}:3260-iscsi-{target}-lun-1")
}

fn join(root: &str, tail: &str) -> String {
    format!("{}/{tail}", root.trim_end_matches('/'))
}
