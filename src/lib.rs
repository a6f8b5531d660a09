pub mod ancestor;
pub mod authorizer;
pub mod batcher;
pub mod canonical_json;
pub mod change_source;
pub mod checkpoint_cache;
pub mod config;
pub mod diff;
pub mod error;
pub mod model;
pub mod pending;
pub mod replicator;
pub mod transport;
pub mod uploader;

pub use authorizer::{Authorizer, BasicAuthorizer, OAuth1Authorizer};
pub use change_source::{AttachmentSource, ChangeNotification, ChangeSource, ChangesPage, Filter, MemoryStore};
pub use checkpoint_cache::{CheckpointCache, CheckpointDocument};
pub use config::ReplicatorConfig;
pub use error::{ReplicatorError, TransportError};
pub use model::{Properties, Revision, RevisionId, RevisionList};
pub use replicator::{never_stop, FilterSpec, LifecycleState, PushReplicator, ReplicatorStatus};
pub use transport::{HttpTransport, MultipartPart, RemoteTransport};
