//! Integration tests for vmexec.

mod pipeline_tests;
mod vsphere_tests;
