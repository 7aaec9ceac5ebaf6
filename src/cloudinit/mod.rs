//! Cloud-init NoCloud seed content
//!
//! A seed image is an ISO-9660 volume labelled `cidata` holding three files,
//! each rendered from the same template: either the template's section of that
//! name or, without one, its top-level text.

pub mod iso;
pub mod template;

pub use iso::{file_identifier, IsoWriter, SECTOR_SIZE};
pub use template::FieldTemplate;

use crate::domain::ports::{ContentRenderer, ImageFile, IsoImageWriter};
use crate::error::{Result, ResultExt};
use tracing::debug;

/// Volume label cloud-init's NoCloud datasource looks for
pub const SEED_VOLUME_LABEL: &str = "cidata";

/// Seed files, in the order they are rendered
pub const SEED_FILES: [&str; 3] = ["meta-data", "network-config", "user-data"];

/// Render every seed file from `template` and package them into an ISO image
pub fn build_seed_image(
    renderer: &dyn ContentRenderer,
    writer: &dyn IsoImageWriter,
    template: &str,
    context: &serde_json::Value,
) -> Result<Vec<u8>> {
    let mut files = Vec::with_capacity(SEED_FILES.len());
    for name in SEED_FILES {
        let data = renderer.render(template, name, context).context(name)?;
        debug!("Rendered {} ({} bytes)", name, data.len());
        files.push(ImageFile::new(name, data));
    }
    writer.write_iso(SEED_VOLUME_LABEL, &files)
}
