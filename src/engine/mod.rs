pub mod offers;
pub mod permission;
pub mod progress;
pub mod provider;
pub mod sync;
