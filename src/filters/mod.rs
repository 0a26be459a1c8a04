// Filter implementations for position stream smoothing

pub mod linear_cv;

pub use linear_cv::LinearCvFilter;
