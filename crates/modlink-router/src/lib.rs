//! # modlink-router
//!
//! Declarative "when event A happens and conditions hold, publish event B"
//! automation on top of [`modlink_bus`].
//!
//! A [`RouterConfig`] document lists routes. Each route names a source event
//! kind, a conjunctive list of conditions over the source event's fields,
//! and actions that synthesize new events whose parameters may reference
//! source fields through `${path}` placeholders.
//!
//! ## Execution
//!
//! ```text
//!  bus delivers event of kind K
//!       │
//!       └── spawn routing task
//!               ├── routes[K] in priority order
//!               │     └── conditions (short-circuit)
//!               └── matched actions, concurrently:
//!                     acquire limiter slot ─ delay ─ resolve parameters
//!                     ─ create target event ─ publish ─ release slot
//! ```
//!
//! Unknown kinds, unknown operators and unreadable properties skip the
//! affected route or action and are logged; they never fail the router.

pub mod condition;
pub mod config;
pub mod error;
pub mod placeholder;
pub mod router;

pub use condition::{Condition, Operator};
pub use config::{ActionConfig, ConditionConfig, RouteConfig, RouterConfig, RouterSettings};
pub use error::{RouterError, RouterResult};
pub use router::{CommunicationRouter, RouterStats, RoutingOutcome};
