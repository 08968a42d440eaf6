pub mod icbhi;
