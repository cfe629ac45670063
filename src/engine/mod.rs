pub mod confirmation;
pub mod lifecycle;
pub mod poll;
pub mod push;
pub mod status_map;
pub mod store;
pub mod timer;
