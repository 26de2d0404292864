use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::exporter::CollaboratorError;

/// Host uptime counters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Uptime {
    /// Seconds since boot.
    pub uptime_seconds: f64,

    /// Seconds spent idle since boot, summed over every CPU.
    pub idle_seconds: f64,
}

/// A source of host uptime counters.
pub trait UptimeSource: Send + Sync {
    /// Reads the current uptime counters.
    ///
    /// # Errors
    ///
    /// If the counters cannot be read or are malformed, an error is returned.
    fn read(&self) -> Result<Uptime, CollaboratorError>;
}

/// Reads uptime counters from `<statspath>/proc/uptime`.
///
/// The stats path is `/` on a live host, but can point at a captured copy of `/proc` instead.
#[derive(Clone, Debug)]
pub struct ProcUptime {
    path: PathBuf,
}

impl ProcUptime {
    /// Creates a `ProcUptime` reading `<statspath>/proc/uptime`.
    pub fn new<P: AsRef<Path>>(statspath: P) -> Self {
        ProcUptime { path: statspath.as_ref().join("proc/uptime") }
    }

    /// Path of the file being read.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for ProcUptime {
    fn default() -> Self {
        ProcUptime::new("/")
    }
}

impl UptimeSource for ProcUptime {
    fn read(&self) -> Result<Uptime, CollaboratorError> {
        let contents = fs::read_to_string(&self.path)
            .map_err(|source| CollaboratorError::FileUnreadable { path: self.path.clone(), source })?;

        parse_uptime(&contents)
    }
}

/// Parses the two leading numbers of an uptime file. Anything after them is ignored.
fn parse_uptime(contents: &str) -> Result<Uptime, CollaboratorError> {
    let mut fields = contents.split_whitespace();
    let mut next = |what: &str| {
        let field = fields.next().ok_or_else(|| CollaboratorError::MalformedCollaboratorData {
            reason: format!("missing {}", what),
        })?;
        field.parse::<f64>().ok().filter(|n| n.is_finite()).ok_or_else(|| {
            CollaboratorError::MalformedCollaboratorData {
                reason: format!("invalid {} '{}'", what, field),
            }
        })
    };

    let uptime_seconds = next("uptime")?;
    let idle_seconds = next("idle time")?;
    Ok(Uptime { uptime_seconds, idle_seconds })
}
