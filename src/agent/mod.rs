//! Collaborators the HA engines act through, and their adapters.

pub mod lb;
pub mod local;
pub mod node;
pub mod probe;
pub mod service;

pub use lb::{backend_diff, HttpLoadBalancer, LoadBalancer};
pub use local::{CommandPinger, Fencer, Pinger, ShellFencer};
pub use node::{
    AgentConnector, BuildStandbyParams, NodeControl, Reply, RpcAgentConnector, RpcNodeControl,
    UpstreamConfig,
};
pub use probe::{AgentProbe, DbEndpoint, DbProbe, Lsn, TriggerCall};
pub use service::{node_control_functions, probe_functions};
