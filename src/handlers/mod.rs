pub mod directory_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod tenant_extractor;
