//! Sandbox image recipe: Dockerfile rendering, content-addressed tags and the
//! in-memory build context.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::lifecycle::BuildContext;
use crate::types::BootstrapMetadata;

/// Where the setup script lands inside the build.
pub const SETUP_SCRIPT_PATH: &str = "/tmp/setup.sh";

/// Tag derived from everything that shapes the image, so identical recipes
/// share one image.
pub fn image_tag(prefix: &str, base_image: &str, metadata: &BootstrapMetadata) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base_image.as_bytes());
    hasher.update([0u8]);
    hasher.update(metadata.setup_script.as_bytes());
    hasher.update([0u8]);
    hasher.update(metadata.run_command.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}:{}", prefix, &digest[..16])
}

fn quoted(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

pub fn render_dockerfile(base_image: &str, metadata: &BootstrapMetadata) -> String {
    format!(
        "FROM {base}\n\
         LABEL mcpbox.repository={repo}\n\
         ENV DEBIAN_FRONTEND=noninteractive\n\
         COPY setup.sh {script}\n\
         RUN chmod +x {script} && bash {script}\n\
         CMD [\"/bin/bash\", \"-c\", {run}]\n",
        base = base_image,
        repo = quoted(&metadata.repository_url),
        script = SETUP_SCRIPT_PATH,
        run = quoted(&metadata.run_command),
    )
}

/// Tar archive holding `Dockerfile` and `setup.sh`.
pub fn pack_context(context: &BuildContext) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    for (name, contents, mode) in [
        ("Dockerfile", context.dockerfile.as_bytes(), 0o644),
        ("setup.sh", context.setup_script.as_bytes(), 0o755),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(mode);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, name, contents)?;
    }

    builder.into_inner()
}
