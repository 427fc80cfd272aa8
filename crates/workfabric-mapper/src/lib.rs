//! Workfabric Mapper - Control Node of the Dispatch Fabric
//!
//! Agents register over the broker and advertise service routes plus a
//! load metric; the mapper keeps the live directory, picks targets per
//! request, correlates replies into jobs, and parks untargetable
//! requests on a durable queue for later redelivery.
//!
//! ```text
//!  agents ──register/heartbeat──► membership fanout ──► ClusterRegistry
//!                                                            │ targets_for
//!  caller ──request/push──────► Mapper façade ───────────────┤
//!                                   │                        │ route
//!                                   │ job per token          ▼
//!                                   ▼                  agent queues
//!                               JobWarden ◄── replies ── mapper inbox
//!                                                        (fanout-bound)
//!                               mapper-offline ◄── no-target requests,
//!                                 re-swept every redelivery period
//! ```
//!
//! Everything mutable is owned by exactly one component: the registry
//! owns the agent table and service index, the warden owns the job
//! table, and the façade reaches both only through their methods. All
//! broker callbacks for one queue run serially, and no internal lock is
//! ever held across an await, so selection always sees a consistent
//! snapshot.
//!
//! ## Example
//!
//! ```ignore
//! use workfabric_broker::MemoryBroker;
//! use workfabric_mapper::{Dispatch, Mapper, RequestOptions};
//!
//! let mapper = Mapper::builder()
//!     .identity("core")
//!     .broker(broker)
//!     .build()?;
//! mapper.start().await?;
//!
//! match mapper.request("hash", "abc", RequestOptions::default()).await? {
//!     Dispatch::Accepted(job) => {
//!         let outcome = job.outcome().await?;
//!         println!("{} replies", outcome.results.len());
//!     }
//!     Dispatch::Offline => println!("parked for later"),
//!     Dispatch::NoTargets => println!("nobody home"),
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod mapper;
mod offline;
pub mod ticker;
pub mod warden;

pub use cluster::{AgentRecord, ClusterRegistry};
pub use config::{BrokerSettings, MapperConfig, DEFAULT_AGENT_TIMEOUT, DEFAULT_OFFLINE_REDELIVERY_FREQUENCY};
pub use error::{MapperError, Result};
pub use mapper::{Dispatch, Mapper, MapperBuilder, RequestOptions, MEMBERSHIP_EXCHANGE, OFFLINE_QUEUE};
pub use ticker::Ticker;
pub use warden::{JobHandle, JobOutcome, JobState, JobWarden};
