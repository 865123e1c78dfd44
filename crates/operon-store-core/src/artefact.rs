//! Artefact path conventions for script outputs.
//!
//! Per-task artefacts are stored under a kind-specific prefix with an ISO
//! timestamp folded into the object name so repeated runs never collide.

use chrono::{DateTime, Utc};

/// The artefact kinds scripts may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtefactKind {
    /// Rendered HTML report.
    HtmlReport,
    /// Diagram in drawio XML.
    Diagram,
    /// Raster image.
    Image,
}

impl ArtefactKind {
    /// Parse the `kind` tag used in `emit` script steps.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "html_report" => Some(Self::HtmlReport),
            "diagram" => Some(Self::Diagram),
            "image" => Some(Self::Image),
            _ => None,
        }
    }

    /// Content type served for this kind.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::HtmlReport => "text/html",
            Self::Diagram => "application/xml",
            Self::Image => "image/png",
        }
    }

    /// File-type tag recorded in object metadata.
    pub fn file_type(&self) -> &'static str {
        match self {
            Self::HtmlReport => "html",
            Self::Diagram => "drawio",
            Self::Image => "png",
        }
    }

    /// Bucket path for an artefact named `filename`, stamped at `at`.
    ///
    /// `reports/<iso>_<name>` for HTML, `diagrams/<iso>_<name>.drawio` for
    /// diagrams, `images/<iso>_<name>.png` for raster images.
    pub fn object_path(&self, at: DateTime<Utc>, filename: &str) -> String {
        let stamp = at.format("%Y-%m-%dT%H-%M-%SZ");
        match self {
            Self::HtmlReport => format!("reports/{stamp}_{filename}"),
            Self::Diagram => format!("diagrams/{stamp}_{}.drawio", strip_suffix(filename, ".drawio")),
            Self::Image => format!("images/{stamp}_{}.png", strip_suffix(filename, ".png")),
        }
    }

    /// `content_disposition` header value for `filename`.
    pub fn content_disposition(&self, filename: &str) -> String {
        format!("attachment; filename={filename}")
    }
}

fn strip_suffix<'a>(name: &'a str, suffix: &str) -> &'a str {
    name.strip_suffix(suffix).unwrap_or(name)
}
