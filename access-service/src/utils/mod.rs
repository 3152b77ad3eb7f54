pub mod password;

pub use password::{
    check_password_requirements, generate_one_time_password, hash_password, verify_password,
    Password,
};
