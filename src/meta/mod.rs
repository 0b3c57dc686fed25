pub mod delete_bitmap;
pub mod file_header;
pub mod rowset;
pub mod schema;
pub mod tablet_meta;
