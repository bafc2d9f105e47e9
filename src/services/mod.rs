pub mod directory_service;
pub mod error;
pub mod file_service;
pub mod notifications;
pub mod path_index;
pub mod storage;
pub mod tenant;
