//! End-to-end flows over the simulated printer.

mod scenario_tests;
