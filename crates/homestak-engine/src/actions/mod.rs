// Concrete actions, grouped by the external collaborator they drive.

pub mod configure;
pub mod credential;
pub mod delegate;
pub mod image;
pub mod provision;
pub mod resource;
pub mod ssh;
