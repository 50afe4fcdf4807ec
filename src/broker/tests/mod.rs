pub mod common;
mod test_broker;
