pub mod context;
pub mod operation;
pub mod registry;
pub mod routing;
pub mod state;
pub mod transactional;

pub use context::{ContextKey, ContextToken, SessionContext};
pub use operation::{Operation, OperationKind};
pub use registry::{ScopedSession, SessionRegistry};
pub use routing::{ReadRouting, Session, SessionOptions};
pub use state::{SessionEvent, SessionState, route};
pub use transactional::{Transactional, standalone_session, transactional};
