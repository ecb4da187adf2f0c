pub mod infrastructure;
pub mod inventoried_timestamp;
pub mod machine;
pub mod platform_remote_id;
pub mod reading;
