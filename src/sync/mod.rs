//! Components reconciling local state with the remote service. Each owns its own cached state;
//! the [Controller](crate::controller::Controller) wires them together.

pub mod connectivity;
pub mod preferences;
pub mod reconciler;
pub mod summary;
pub mod uploader;
