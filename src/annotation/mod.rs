pub mod builder;
pub mod io;

pub use builder::{AnnotatedTranscript, AnnotationBuilder, IdNameKeys};
pub use io::{AnnotationReader, AnnotationRecord, Dialect};
