pub mod events;
pub mod manager;

pub use events::TaskEvent;
pub use manager::TaskManager;
