use crate::config::{ConfigError, GpuConfig};
use crate::core::{GpuId, Mode};
use nvml_wrapper::Nvml;

/// Total/used memory of one device, probed once during initialization.
#[derive(Debug, Clone, Copy)]
pub struct GpuMemory {
    pub total_mb: u64,
    pub used_mb: u64,
}

/// Driver query facility. Only consulted while the inventory is built; the
/// scheduling hot path never touches the driver. Behind a trait so tests run
/// on hosts without GPUs.
#[cfg_attr(test, mockall::automock)]
pub trait GpuProbe {
    fn device_count(&self) -> anyhow::Result<usize>;
    fn memory_mb(&self, index: usize) -> anyhow::Result<GpuMemory>;
    fn driver_version(&self) -> anyhow::Result<String>;
    fn cuda_version(&self) -> anyhow::Result<i32>;
}

/// NVML-backed probe used by the binary.
pub struct NvmlProbe {
    nvml: Nvml,
}

impl NvmlProbe {
    pub fn init() -> anyhow::Result<Self> {
        Ok(Self { nvml: Nvml::init()? })
    }
}

impl GpuProbe for NvmlProbe {
    fn device_count(&self) -> anyhow::Result<usize> {
        Ok(self.nvml.device_count()? as usize)
    }

    fn memory_mb(&self, index: usize) -> anyhow::Result<GpuMemory> {
        let device = self.nvml.device_by_index(index as u32)?;
        let info = device.memory_info()?;
        Ok(GpuMemory {
            total_mb: info.total / 1024 / 1024,
            used_mb: info.used / 1024 / 1024,
        })
    }

    fn driver_version(&self) -> anyhow::Result<String> {
        Ok(self.nvml.sys_driver_version()?)
    }

    fn cuda_version(&self) -> anyhow::Result<i32> {
        Ok(self.nvml.sys_cuda_driver_version()?)
    }
}

#[derive(Debug, Clone)]
pub struct Gpu {
    pub id: GpuId,
    /// Driver-reported capacity; memory mode only.
    pub total_memory_mb: Option<u64>,
    /// Free-memory counter seed for the ledger; memory mode only.
    pub initial_free_mb: Option<u64>,
}

/// Immutable table of the devices the scheduler may hand out, built once at
/// startup. In memory mode each device is probed exactly once here to seed
/// the ledger.
#[derive(Debug)]
pub struct Inventory {
    gpus: Vec<Gpu>,
}

impl Inventory {
    /// Build the inventory without consulting the driver. Exclusive mode
    /// with an explicit `gpu:` section needs no probe: devices are opaque
    /// tokens.
    pub fn from_config(gpus: &[GpuConfig]) -> Result<Self, ConfigError> {
        check_duplicates(gpus)?;
        Ok(Self {
            gpus: gpus
                .iter()
                .map(|entry| Gpu {
                    id: entry.id.clone(),
                    total_memory_mb: None,
                    initial_free_mb: None,
                })
                .collect(),
        })
    }

    /// Build the inventory against the driver's enumeration. With no `gpu:`
    /// section (legacy batch form) every detected device is used, ids
    /// `"0".."n-1"`.
    pub fn detect(
        gpus: Option<&[GpuConfig]>,
        probe: &dyn GpuProbe,
        mode: Mode,
    ) -> Result<Self, ConfigError> {
        let detected = probe
            .device_count()
            .map_err(|err| ConfigError::Probe(err.to_string()))?;

        let entries: Vec<GpuConfig> = match gpus {
            Some(entries) => entries.to_vec(),
            None => (0..detected)
                .map(|index| GpuConfig {
                    id: compact_str::format_compact!("{index}"),
                    memory: None,
                })
                .collect(),
        };

        if entries.len() > detected {
            return Err(ConfigError::TooManyGpus {
                configured: entries.len(),
                detected,
            });
        }
        check_duplicates(&entries)?;

        if mode == Mode::Memory {
            log_driver_banner(probe);
        }

        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            let index = entry
                .id
                .parse::<usize>()
                .ok()
                .filter(|&index| index < detected)
                .ok_or_else(|| ConfigError::UnknownGpu {
                    id: entry.id.clone(),
                })?;

            let (total_memory_mb, initial_free_mb) = match mode {
                Mode::Exclusive => (None, None),
                Mode::Memory => {
                    let memory = probe
                        .memory_mb(index)
                        .map_err(|err| ConfigError::Probe(err.to_string()))?;
                    let mut free = memory.total_mb.saturating_sub(memory.used_mb);
                    if let Some(cap) = entry.memory {
                        free = free.min(cap);
                    }
                    tracing::info!(
                        " - GPU {}: {} MB total, {} MB used, seeding {} MB",
                        entry.id,
                        memory.total_mb,
                        memory.used_mb,
                        free
                    );
                    (Some(memory.total_mb), Some(free))
                }
            };

            out.push(Gpu {
                id: entry.id.clone(),
                total_memory_mb,
                initial_free_mb,
            });
        }

        Ok(Self { gpus: out })
    }

    pub fn list(&self) -> &[Gpu] {
        &self.gpus
    }

    pub fn len(&self) -> usize {
        self.gpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gpus.is_empty()
    }
}

fn check_duplicates(gpus: &[GpuConfig]) -> Result<(), ConfigError> {
    for (i, entry) in gpus.iter().enumerate() {
        if gpus[..i].iter().any(|other| other.id == entry.id) {
            return Err(ConfigError::DuplicateGpu {
                id: entry.id.clone(),
            });
        }
    }
    Ok(())
}

fn log_driver_banner(probe: &dyn GpuProbe) {
    match (probe.driver_version(), probe.cuda_version()) {
        (Ok(driver), Ok(cuda)) => tracing::info!(
            "GPU information: driver {}, CUDA {}.{}",
            driver,
            cuda / 1000,
            (cuda % 1000) / 10
        ),
        (driver, cuda) => tracing::debug!(
            "could not query driver/CUDA versions: {:?} / {:?}",
            driver.err(),
            cuda.err()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(id: &str, memory: Option<u64>) -> GpuConfig {
        GpuConfig {
            id: id.into(),
            memory,
        }
    }

    fn probe_with(total: u64, used: u64, count: usize) -> MockGpuProbe {
        let mut probe = MockGpuProbe::new();
        probe.expect_device_count().returning(move || Ok(count));
        probe
            .expect_memory_mb()
            .returning(move |_| Ok(GpuMemory { total_mb: total, used_mb: used }));
        probe
            .expect_driver_version()
            .returning(|| Ok("550.54".to_string()));
        probe.expect_cuda_version().returning(|| Ok(12040));
        probe
    }

    #[test]
    fn test_from_config_skips_the_driver() {
        let inventory =
            Inventory::from_config(&[gpu("0", None), gpu("1", None)]).unwrap();
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory.list()[0].id, "0");
        assert!(inventory.list()[0].initial_free_mb.is_none());
    }

    #[test]
    fn test_from_config_rejects_duplicate_ids() {
        let err = Inventory::from_config(&[gpu("0", None), gpu("0", None)]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateGpu { .. }));
    }

    #[test]
    fn test_detect_seeds_free_memory_once_per_gpu() {
        let mut probe = MockGpuProbe::new();
        probe.expect_device_count().returning(|| Ok(2));
        probe
            .expect_memory_mb()
            .times(2)
            .returning(|_| Ok(GpuMemory { total_mb: 16000, used_mb: 2000 }));
        probe
            .expect_driver_version()
            .returning(|| Ok("550.54".to_string()));
        probe.expect_cuda_version().returning(|| Ok(12040));

        let inventory = Inventory::detect(
            Some(&[gpu("0", None), gpu("1", None)]),
            &probe,
            Mode::Memory,
        )
        .unwrap();
        assert_eq!(inventory.list()[0].initial_free_mb, Some(14000));
        assert_eq!(inventory.list()[1].total_memory_mb, Some(16000));
    }

    #[test]
    fn test_detect_caps_seed_with_declared_memory() {
        let probe = probe_with(24000, 0, 1);
        let inventory =
            Inventory::detect(Some(&[gpu("0", Some(16000))]), &probe, Mode::Memory).unwrap();
        assert_eq!(inventory.list()[0].initial_free_mb, Some(16000));
    }

    #[test]
    fn test_detect_rejects_unknown_id() {
        let probe = probe_with(16000, 0, 2);
        let err = Inventory::detect(Some(&[gpu("7", None)]), &probe, Mode::Memory).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownGpu { .. }));

        let probe = probe_with(16000, 0, 2);
        let err =
            Inventory::detect(Some(&[gpu("left", None)]), &probe, Mode::Memory).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownGpu { .. }));
    }

    #[test]
    fn test_detect_rejects_more_gpus_than_detected() {
        let probe = probe_with(16000, 0, 1);
        let err = Inventory::detect(
            Some(&[gpu("0", None), gpu("1", None)]),
            &probe,
            Mode::Memory,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::TooManyGpus { configured: 2, detected: 1 }));
    }

    #[test]
    fn test_detect_defaults_to_full_enumeration() {
        let probe = probe_with(16000, 0, 3);
        let inventory = Inventory::detect(None, &probe, Mode::Exclusive).unwrap();
        assert_eq!(inventory.len(), 3);
        assert_eq!(inventory.list()[2].id, "2");
        // Exclusive mode never reads memory counters.
        assert!(inventory.list().iter().all(|g| g.initial_free_mb.is_none()));
    }
}
