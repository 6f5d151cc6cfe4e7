pub mod batch_controller;
pub mod fs_service;
pub mod preview_service;
pub mod result_exporter;
pub mod upload_client;
