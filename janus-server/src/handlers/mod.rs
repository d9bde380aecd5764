pub mod events;
pub mod inventory;
pub mod jobs;
pub mod layout;
