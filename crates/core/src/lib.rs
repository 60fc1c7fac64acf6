pub mod block;
pub mod clock;
pub mod error;
pub mod ids;
pub mod mutation;
pub mod position;
pub mod value;

pub use block::{Block, BlockDraft, BlockKind, BlockPatch, Scope};
pub use clock::{LocalClock, Timestamp};
pub use error::CoreError;
pub use ids::*;
pub use mutation::{MutationKind, MutationPayload, PendingMutation};
pub use position::{Placement, PositionStrategy};
pub use value::Value;
