use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a reference file's name becomes an identity label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelStyle {
    /// `alice.jpg` → `alice.jpg`
    #[default]
    FileName,
    /// `alice.jpg` → `alice`; several images of one person may share a label.
    FileStem,
}

/// Identity label for a reference image, or `None` for paths without a file name.
pub fn label_for(path: &Path, style: LabelStyle) -> Option<String> {
    let part = match style {
        LabelStyle::FileName => path.file_name(),
        LabelStyle::FileStem => path.file_stem(),
    }?;
    let label = part.to_string_lossy().into_owned();
    (!label.is_empty()).then_some(label)
}
