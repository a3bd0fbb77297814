pub mod archive;
pub mod folders;
pub mod gateway;
pub mod history;
pub mod keys;
pub mod multipart;
