pub mod confirmation;
pub mod courier;
pub mod order;
pub mod step;
