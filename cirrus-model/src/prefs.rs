//! Persisted view preferences.
//!
//! Two small indices select which pane and which machine view the console
//! restores on start. They are stored as JSON under the user config
//! directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::Kind;

const FILE_NAME: &str = "view.json";

/// Top-level panes, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    Machines,
    Networks,
    Volumes,
    Images,
    Keys,
}

impl Pane {
    pub const ALL: [Pane; 5] = [
        Pane::Machines,
        Pane::Networks,
        Pane::Volumes,
        Pane::Images,
        Pane::Keys,
    ];

    /// Pane for a stored index; out-of-range values fall back to machines.
    pub fn from_index(index: u8) -> Self {
        Self::ALL
            .get(index as usize)
            .copied()
            .unwrap_or(Pane::Machines)
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn kind(self) -> Kind {
        match self {
            Pane::Machines => Kind::VirtualMachine,
            Pane::Networks => Kind::Network,
            Pane::Volumes => Kind::Volume,
            Pane::Images => Kind::Image,
            Pane::Keys => Kind::PublicKey,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineView {
    Table,
    Compact,
}

impl MachineView {
    pub fn from_index(index: u8) -> Self {
        match index {
            1 => MachineView::Compact,
            _ => MachineView::Table,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewPrefs {
    pub pane_view: u8,
    pub machine_view: u8,
}

impl ViewPrefs {
    pub fn pane(&self) -> Pane {
        Pane::from_index(self.pane_view)
    }

    pub fn machine(&self) -> MachineView {
        MachineView::from_index(self.machine_view)
    }

    /// `<config dir>/cirrus/view.json`
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("cirrus").join(FILE_NAME))
            .ok_or_else(|| Error::Prefs("no config directory".to_string()))
    }

    /// Load preferences; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| Error::Prefs(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Prefs(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Prefs(format!("{}: {}", parent.display(), e)))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| Error::Prefs(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = ViewPrefs::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(prefs, ViewPrefs::default());
        assert_eq!(prefs.pane(), Pane::Machines);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cirrus").join("view.json");
        let prefs = ViewPrefs {
            pane_view: Pane::Volumes.index(),
            machine_view: MachineView::Compact.index(),
        };
        prefs.save(&path).unwrap();

        let loaded = ViewPrefs::load(&path).unwrap();
        assert_eq!(loaded, prefs);
        assert_eq!(loaded.pane(), Pane::Volumes);
        assert_eq!(loaded.pane().kind(), Kind::Volume);
        assert_eq!(loaded.machine(), MachineView::Compact);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("view.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(ViewPrefs::load(&path), Err(Error::Prefs(_))));
    }

    #[test]
    fn test_out_of_range_indices_fall_back() {
        let prefs = ViewPrefs {
            pane_view: 42,
            machine_view: 9,
        };
        assert_eq!(prefs.pane(), Pane::Machines);
        assert_eq!(prefs.machine(), MachineView::Table);
    }
}
