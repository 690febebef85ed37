pub mod id;
pub mod role;

pub use id::{generate_id, CameraId, ConnectionId};
pub use role::{Role, UserType};
