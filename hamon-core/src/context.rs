// hamon-core: shared engine context
// The two singleton roots, both job queues and the daemon-wide flags in one
// owned value; worker threads share it behind an Arc.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hamon_config::HaConfig;
use hamon_proto::ControlCommand;
use parking_lot::{Mutex, RwLock};

use crate::cluster::jobs::ClusterJob;
use crate::cluster::Cluster;
use crate::jobs::JobQueue;
use crate::log_gate::LogGate;
use crate::resource::jobs::ResourceJob;
use crate::resource::Resource;

/// Writable handle to one child's control connection. The daemon implements
/// this over its Unix-socket streams; tests use an in-memory double.
pub trait ControlConn: Send + Sync {
    /// Stable identifier of the connection (the accept counter).
    fn id(&self) -> u64;

    fn send_command(&self, command: ControlCommand) -> std::io::Result<()>;

    fn send_data(&self, data: &[u8]) -> std::io::Result<()>;
}

/// Captured server pids while a deactivation is in flight.
#[derive(Debug, Default)]
pub struct DeactivateInfo {
    pub server_pids: Vec<i32>,
    pub info_started: bool,
}

/// Everything the HA engine owns. Lock order when several are needed:
/// `cluster` before `resource`; queue locks are leaves.
pub struct HaContext {
    config: RwLock<Arc<HaConfig>>,

    pub cluster: Mutex<Cluster>,
    pub resource: Mutex<Resource>,

    pub cluster_jobs: JobQueue<ClusterJob>,
    pub resource_jobs: JobQueue<ResourceJob>,

    pub deactivate: Mutex<DeactivateInfo>,
    pub deactivate_immediately: AtomicBool,

    /// Mirror of `cluster.is_isolated` for paths that only hold the
    /// resource lock; refreshed by every CALC_SCORE.
    pub isolated: AtomicBool,

    pub log_gate: LogGate,
}

impl HaContext {
    pub fn new(config: HaConfig) -> std::io::Result<Self> {
        let host_name = hostname::get()?
            .to_string_lossy()
            .into_owned();

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            cluster: Mutex::new(Cluster::new(host_name)),
            resource: Mutex::new(Resource::new()),
            cluster_jobs: JobQueue::new(),
            resource_jobs: JobQueue::new(),
            deactivate: Mutex::new(DeactivateInfo::default()),
            deactivate_immediately: AtomicBool::new(false),
            isolated: AtomicBool::new(false),
            log_gate: LogGate::new(),
        })
    }

    /// Context with an explicit local hostname; used by tests.
    pub fn with_host_name(config: HaConfig, host_name: &str) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            cluster: Mutex::new(Cluster::new(host_name.to_string())),
            resource: Mutex::new(Resource::new()),
            cluster_jobs: JobQueue::new(),
            resource_jobs: JobQueue::new(),
            deactivate: Mutex::new(DeactivateInfo::default()),
            deactivate_immediately: AtomicBool::new(false),
            isolated: AtomicBool::new(false),
            log_gate: LogGate::new(),
        }
    }

    pub fn config(&self) -> Arc<HaConfig> {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: HaConfig) {
        *self.config.write() = Arc::new(config);
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::Relaxed)
    }

    pub fn set_isolated(&self, isolated: bool) {
        self.isolated.store(isolated, Ordering::Relaxed);
    }

    pub fn deactivate_immediately(&self) -> bool {
        self.deactivate_immediately.load(Ordering::Relaxed)
    }
}
