mod rate_setter_tests;
mod reconcile_engine_tests;
