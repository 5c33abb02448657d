//! Scanning the host for supported cards and folding the result into the pool.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use api_types::DeviceClass;
use glob::glob;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::shared_memory::DeviceQueue;
use utils::shared_memory::QueueError;

/// Lowest firmware API revision the monitor can talk to.
pub const MIN_FW_API_REVISION: &str = "250";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("sysfs root {path} is not a directory")]
    MissingRoot { path: PathBuf },

    #[error("invalid controller pattern {pattern}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// One module found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub class: DeviceClass,
    pub dev_name: String,
    pub blk_name: String,
    pub hw_id: i32,
    pub fw_rev: String,
}

pub trait DeviceDiscovery {
    /// Lists the modules currently present, optionally skipping cards whose
    /// firmware is too old.
    fn scan(&self, match_fw_revision: bool) -> Result<Vec<DiscoveredDevice>, DiscoveryError>;
}

/// Whether the firmware API revision (first three characters) is supported.
pub fn is_fw_compatible(fw_rev: &str) -> bool {
    fw_rev
        .get(..3)
        .is_some_and(|api_rev| api_rev >= MIN_FW_API_REVISION)
}

/// Finds NVMe transcoder cards through sysfs.
#[derive(Debug, Clone)]
pub struct SysfsDiscovery {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    model_tag: String,
}

impl SysfsDiscovery {
    pub fn new(
        sysfs_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
        model_tag: impl Into<String>,
    ) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: dev_root.into(),
            model_tag: model_tag.into(),
        }
    }

    fn read_attribute(ctrl_path: &Path, name: &str) -> Option<String> {
        match fs::read_to_string(ctrl_path.join(name)) {
            Ok(value) => Some(value.trim().to_string()),
            Err(e) => {
                debug!(path = %ctrl_path.display(), attribute = name, error = %e, "Unreadable controller attribute");
                None
            }
        }
    }

    /// Lowest-numbered namespace directory `<ctrl>n<k>` of a controller.
    fn first_namespace(ctrl_path: &Path, ctrl: &str) -> Option<String> {
        let prefix = format!("{ctrl}n");
        let entries = fs::read_dir(ctrl_path).ok()?;

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| {
                let index = name.strip_prefix(&prefix)?.parse::<u32>().ok()?;
                Some((index, name))
            })
            .min_by_key(|(index, _)| *index)
            .map(|(_, name)| name)
    }

    fn controller_index(ctrl: &str) -> Option<u32> {
        ctrl.strip_prefix("nvme")?.parse().ok()
    }

    fn inspect_controller(&self, ctrl_path: &Path, ctrl: &str, match_fw_revision: bool) -> Option<[DiscoveredDevice; 2]> {
        let model = Self::read_attribute(ctrl_path, "model")?;
        if !model.contains(&self.model_tag) {
            debug!(ctrl, model = %model, "Skipping unsupported controller");
            return None;
        }

        let fw_rev = Self::read_attribute(ctrl_path, "firmware_rev").unwrap_or_default();
        if match_fw_revision && !is_fw_compatible(&fw_rev) {
            info!(
                ctrl,
                fw_rev = %fw_rev,
                min_api_revision = MIN_FW_API_REVISION,
                "Skipping card with incompatible firmware"
            );
            return None;
        }

        let Some(namespace) = Self::first_namespace(ctrl_path, ctrl) else {
            debug!(ctrl, "Controller has no namespace");
            return None;
        };

        let dev_name = self.dev_root.join(ctrl).to_string_lossy().into_owned();
        let blk_name = self.dev_root.join(&namespace).to_string_lossy().into_owned();

        Some(DeviceClass::ALL.map(|class| DiscoveredDevice {
            class,
            dev_name: dev_name.clone(),
            blk_name: blk_name.clone(),
            hw_id: 0,
            fw_rev: fw_rev.clone(),
        }))
    }
}

impl DeviceDiscovery for SysfsDiscovery {
    fn scan(&self, match_fw_revision: bool) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        if !self.sysfs_root.is_dir() {
            return Err(DiscoveryError::MissingRoot {
                path: self.sysfs_root.clone(),
            });
        }

        let pattern = format!("{}/class/nvme/nvme*", self.sysfs_root.display());
        let paths = glob(&pattern).map_err(|source| DiscoveryError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;

        let mut controllers = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Failed to read controller entry: {}", e);
                    continue;
                }
            };

            let Some(ctrl) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if let Some(index) = Self::controller_index(ctrl) {
                controllers.push((index, ctrl.to_string(), path.clone()));
            }
        }
        // nvme10 after nvme9
        controllers.sort_by_key(|(index, _, _)| *index);

        let devices: Vec<DiscoveredDevice> = controllers
            .iter()
            .filter_map(|(_, ctrl, path)| self.inspect_controller(path, ctrl, match_fw_revision))
            .flatten()
            .collect();

        debug!(count = devices.len(), "Scanned sysfs for modules");
        Ok(devices)
    }
}

/// Outcome of folding one scan into the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: usize,
    pub removed: usize,
    /// Modules registered across all classes afterwards
    pub total: usize,
}

/// Brings the pool in line with a scan.
///
/// New modules get the next free id of their class, modules missing from the
/// scan are dropped and load order is restored. The queue is left untouched
/// if it fails validation.
pub fn reconcile(
    queue: &mut DeviceQueue,
    scanned: &[DiscoveredDevice],
) -> Result<RefreshSummary, QueueError> {
    queue.validate()?;

    let mut summary = RefreshSummary::default();

    for class in DeviceClass::ALL {
        let present: HashSet<(&str, i32)> = scanned
            .iter()
            .filter(|d| d.class == class)
            .map(|d| (d.blk_name.as_str(), d.hw_id))
            .collect();

        let class_queue = queue.class_mut(class);
        let removed = class_queue.retain(|r| present.contains(&(r.blk_name(), r.hw_id)));
        for record in &removed {
            info!(
                %class,
                module_id = record.module_id,
                blk_name = %record.blk_name(),
                fw_rev = %record.fw_rev(),
                "Module no longer present, removed from pool"
            );
        }
        summary.removed += removed.len();

        for device in scanned.iter().filter(|d| d.class == class) {
            let registered = class_queue
                .records()
                .iter()
                .any(|r| r.blk_name() == device.blk_name && r.hw_id == device.hw_id);
            if registered {
                continue;
            }

            // rejections are logged by register; keep scanning
            if let Ok(module_id) = class_queue.register(
                device.hw_id,
                &device.dev_name,
                &device.blk_name,
                &device.fw_rev,
            ) {
                info!(
                    %class,
                    module_id,
                    blk_name = %device.blk_name,
                    fw_rev = %device.fw_rev,
                    "Registered module"
                );
                summary.added += 1;
            }
        }

        class_queue.sort_by_load();
    }

    summary.total = queue.device_count();
    Ok(summary)
}
