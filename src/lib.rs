pub mod check;
pub mod driver;
pub mod interp;
pub mod ir;
pub mod transform;
