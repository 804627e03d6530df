use crate::core::inventory::Inventory;
use crate::core::job::{Job, JobStatus};
use crate::core::{GpuId, Mode};
use compact_str::CompactString;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};

/// One entry of the `gpu:` sequence. YAML authors write ids as bare
/// integers or as strings; both forms end up as the same token.
#[derive(Debug, Clone, Deserialize)]
pub struct GpuConfig {
    #[serde(deserialize_with = "deserialize_gpu_id")]
    pub id: GpuId,
    /// Optional cap on the seeded free-memory counter; memory mode only.
    #[serde(default)]
    pub memory: Option<u64>,
}

/// One entry of the `job:` sequence.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: CompactString,
    pub command: CompactString,
    pub num_gpus: usize,
    /// Per-GPU memory requirement; kept signed so a negative value can be
    /// coerced to 0 with a warning instead of a parse error.
    #[serde(default)]
    pub memory: Option<i64>,
}

fn deserialize_gpu_id<'de, D>(deserializer: D) -> Result<GpuId, D::Error>
where
    D: Deserializer<'de>,
{
    struct IdVisitor;

    impl serde::de::Visitor<'_> for IdVisitor {
        type Value = GpuId;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a GPU id as an integer or a string")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(compact_str::format_compact!("{v}"))
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(compact_str::format_compact!("{v}"))
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(CompactString::from(v))
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

/// The batch document is either a mapping with `gpu:`/`job:` sequences, or
/// (legacy form) the job sequence itself at the top level.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchFileSerde {
    Mapping {
        gpu: Vec<GpuConfig>,
        job: Vec<JobConfig>,
    },
    Legacy(Vec<JobConfig>),
}

#[derive(Debug)]
pub struct BatchFile {
    /// None for the legacy form: the inventory then defaults to the
    /// driver's full enumeration.
    pub gpus: Option<Vec<GpuConfig>>,
    pub jobs: Vec<JobConfig>,
}

impl BatchFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let parsed: BatchFileSerde = serde_yaml::from_str(text).map_err(ConfigError::Parse)?;
        Ok(match parsed {
            BatchFileSerde::Mapping { gpu, job } => Self {
                gpus: Some(gpu),
                jobs: job,
            },
            BatchFileSerde::Legacy(job) => Self { gpus: None, jobs: job },
        })
    }

    /// Materialize the job table entries, assigning ids by input order and
    /// coercing absent/non-positive memory requirements to 0.
    pub fn build_jobs(&self, mode: Mode) -> Vec<Job> {
        self.jobs
            .iter()
            .enumerate()
            .map(|(id, spec)| {
                let memory_mb = match spec.memory {
                    Some(mb) if mb > 0 => mb as u64,
                    _ => {
                        if mode == Mode::Memory {
                            tracing::warn!(
                                "memory of job {id} ({}) is not set, defaulting to 0 MB",
                                spec.name
                            );
                        }
                        0
                    }
                };
                Job {
                    id,
                    name: spec.name.clone(),
                    command: spec.command.clone(),
                    num_gpus: spec.num_gpus,
                    memory_mb,
                    status: JobStatus::Waiting,
                }
            })
            .collect()
    }
}

/// Load-time checks, all fatal before the loop starts.
pub fn validate(jobs: &[Job], inventory: &Inventory, mode: Mode) -> Result<(), ConfigError> {
    if jobs.is_empty() {
        return Err(ConfigError::NoJobs);
    }

    for job in jobs {
        if job.num_gpus == 0 {
            return Err(ConfigError::InvalidNumGpus {
                job: job.name.clone(),
            });
        }
        if job.num_gpus > inventory.len() {
            return Err(ConfigError::NotEnoughGpus {
                job: job.name.clone(),
                num_gpus: job.num_gpus,
                inventory: inventory.len(),
            });
        }
        if mode == Mode::Memory && job.memory_mb > 0 {
            // A job can only ever run if enough devices reach its floor at
            // the seeded steady state; anything short of that would make
            // the loop spin forever.
            let feasible = inventory
                .list()
                .iter()
                .filter(|gpu| gpu.initial_free_mb.unwrap_or(0) >= job.memory_mb)
                .count();
            if feasible < job.num_gpus {
                return Err(ConfigError::Infeasible {
                    job: job.name.clone(),
                    num_gpus: job.num_gpus,
                    memory_mb: job.memory_mb,
                });
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(serde_yaml::Error),
    NoJobs,
    InvalidNumGpus { job: CompactString },
    NotEnoughGpus {
        job: CompactString,
        num_gpus: usize,
        inventory: usize,
    },
    DuplicateGpu { id: GpuId },
    UnknownGpu { id: GpuId },
    TooManyGpus { configured: usize, detected: usize },
    Infeasible {
        job: CompactString,
        num_gpus: usize,
        memory_mb: u64,
    },
    Probe(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, err) => write!(f, "cannot read {}: {err}", path.display()),
            ConfigError::Parse(err) => write!(f, "malformed batch file: {err}"),
            ConfigError::NoJobs => write!(f, "the batch file contains no jobs"),
            ConfigError::InvalidNumGpus { job } => {
                write!(f, "job {job} requests 0 GPUs; num_gpus must be at least 1")
            }
            ConfigError::NotEnoughGpus {
                job,
                num_gpus,
                inventory,
            } => write!(
                f,
                "job {job} requests {num_gpus} GPU(s) but only {inventory} are configured"
            ),
            ConfigError::DuplicateGpu { id } => write!(f, "GPU {id} is listed twice"),
            ConfigError::UnknownGpu { id } => {
                write!(f, "GPU {id} is not present in the driver enumeration")
            }
            ConfigError::TooManyGpus {
                configured,
                detected,
            } => write!(
                f,
                "{configured} GPU(s) configured but the driver reports only {detected}"
            ),
            ConfigError::Infeasible {
                job,
                num_gpus,
                memory_mb,
            } => write!(
                f,
                "job {job} needs {num_gpus} GPU(s) with {memory_mb} MB free; \
                 the inventory can never satisfy that"
            ),
            ConfigError::Probe(err) => write!(f, "GPU driver query failed: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(_, err) => Some(err),
            ConfigError::Parse(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r#"
gpu:
  - id: 0
  - id: "1"
    memory: 16000
job:
  - name: train-a
    command: "python train.py --cfg a.yaml"
    num_gpus: 1
    memory: 6000
  - name: eval-a
    command: "python eval.py | tee eval.log"
    num_gpus: 2
"#;

    const LEGACY: &str = r#"
- name: one
  command: "sleep 0"
  num_gpus: 1
"#;

    #[test]
    fn test_parse_mapping_form() {
        let batch = BatchFile::parse(MAPPING).unwrap();
        let gpus = batch.gpus.as_ref().unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].id, "0");
        assert_eq!(gpus[1].id, "1");
        assert_eq!(gpus[1].memory, Some(16000));
        assert_eq!(batch.jobs.len(), 2);
        assert_eq!(batch.jobs[1].name, "eval-a");
        assert_eq!(batch.jobs[1].memory, None);
    }

    #[test]
    fn test_parse_legacy_top_level_sequence() {
        let batch = BatchFile::parse(LEGACY).unwrap();
        assert!(batch.gpus.is_none());
        assert_eq!(batch.jobs.len(), 1);
        assert_eq!(batch.jobs[0].command, "sleep 0");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            BatchFile::parse("gpu: 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_build_jobs_assigns_ids_and_coerces_memory() {
        let batch = BatchFile::parse(
            r#"
- name: a
  command: "true"
  num_gpus: 1
  memory: -5
- name: b
  command: "true"
  num_gpus: 1
  memory: 4000
"#,
        )
        .unwrap();
        let jobs = batch.build_jobs(Mode::Memory);
        assert_eq!(jobs[0].id, 0);
        assert_eq!(jobs[0].memory_mb, 0);
        assert_eq!(jobs[1].id, 1);
        assert_eq!(jobs[1].memory_mb, 4000);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Waiting));
    }

    fn inventory_of(ids: &[&str]) -> Inventory {
        let gpus: Vec<GpuConfig> = ids
            .iter()
            .map(|id| GpuConfig {
                id: (*id).into(),
                memory: None,
            })
            .collect();
        Inventory::from_config(&gpus).unwrap()
    }

    fn jobs_of(specs: &[(usize, u64)]) -> Vec<Job> {
        specs
            .iter()
            .enumerate()
            .map(|(id, &(num_gpus, memory_mb))| Job {
                id,
                name: compact_str::format_compact!("job-{id}"),
                command: "true".into(),
                num_gpus,
                memory_mb,
                status: JobStatus::Waiting,
            })
            .collect()
    }

    #[test]
    fn test_validate_rejects_empty_batch() {
        let inventory = inventory_of(&["0"]);
        assert!(matches!(
            validate(&[], &inventory, Mode::Exclusive),
            Err(ConfigError::NoJobs)
        ));
    }

    #[test]
    fn test_validate_rejects_zero_gpu_request() {
        let inventory = inventory_of(&["0"]);
        let jobs = jobs_of(&[(0, 0)]);
        assert!(matches!(
            validate(&jobs, &inventory, Mode::Exclusive),
            Err(ConfigError::InvalidNumGpus { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_request_beyond_inventory() {
        let inventory = inventory_of(&["0", "1"]);
        let jobs = jobs_of(&[(3, 0)]);
        assert!(matches!(
            validate(&jobs, &inventory, Mode::Exclusive),
            Err(ConfigError::NotEnoughGpus { num_gpus: 3, inventory: 2, .. })
        ));
    }

    #[test]
    fn test_validate_detects_infeasible_memory_requirement() {
        use crate::core::inventory::{GpuMemory, MockGpuProbe};

        let mut probe = MockGpuProbe::new();
        probe.expect_device_count().returning(|| Ok(2));
        probe
            .expect_memory_mb()
            .returning(|_| Ok(GpuMemory { total_mb: 8000, used_mb: 0 }));
        probe
            .expect_driver_version()
            .returning(|| Ok("550.54".to_string()));
        probe.expect_cuda_version().returning(|| Ok(12040));

        let gpus = [
            GpuConfig { id: "0".into(), memory: None },
            GpuConfig { id: "1".into(), memory: None },
        ];
        let inventory = Inventory::detect(Some(&gpus), &probe, Mode::Memory).unwrap();

        // No single device will ever have 12000 MB free.
        let jobs = jobs_of(&[(1, 12000)]);
        assert!(matches!(
            validate(&jobs, &inventory, Mode::Memory),
            Err(ConfigError::Infeasible { .. })
        ));

        // Two devices reach an 8000 MB floor, but never three.
        let jobs = jobs_of(&[(2, 8000)]);
        assert!(validate(&jobs, &inventory, Mode::Memory).is_ok());
    }
}
