//! Lowering of shader graphs to SVM instruction words.
pub mod compiler;
pub mod emit;
pub mod opcode;
pub mod program;
pub mod stack;
