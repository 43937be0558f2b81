pub mod quik;
