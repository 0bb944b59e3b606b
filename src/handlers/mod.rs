pub mod gc_handlers;
pub mod health_handlers;
pub mod image_handlers;
pub mod statistics_handlers;
