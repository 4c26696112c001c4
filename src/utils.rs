use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use prost::Message;

/// The prefix of every evaluation output directory.
pub const OUTPUT_DIRECTORY_PREFIX: &str = "evaluation_";

/// Generate a new random identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_simple().to_string()
}

/// Generate a new message id for a message published by the given client.
pub fn new_message_id(client_id: &str) -> String {
    format!("ID:{}-m{}", client_id, new_id())
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Message>(model: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(model.encoded_len());
    model.encode(&mut buf).context("error serializing data model")?;
    Ok(buf)
}

/// Decode an object from the given buffer.
pub fn decode_model<M: Message + Default>(data: &[u8]) -> Result<M> {
    M::decode(data).context("error decoding message body")
}

/// The output directory of an evaluation, `{base}[/{job_id}]/evaluation_{id}`.
pub fn evaluation_output_path(base: &Path, job_id: Option<&str>, evaluation_id: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    if let Some(job_id) = job_id.filter(|id| !id.is_empty()) {
        path.push(job_id);
    }
    path.push(format!("{}{}", OUTPUT_DIRECTORY_PREFIX, evaluation_id));
    path
}

/// Create the given output directory, readable, writable and searchable by owner and group.
pub async fn create_output_directory(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("error creating output directory {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))
            .await
            .with_context(|| format!("error setting permissions of output directory {}", path.display()))?;
    }
    Ok(())
}
