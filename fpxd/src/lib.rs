pub mod fcgi_client;
pub mod fpm;
pub mod server;
pub mod static_files;
