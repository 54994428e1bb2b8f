pub use ddh_common::testing::init_test_logging;
