mod elem;
mod error;

pub use elem::{Elem, ElemTy};
pub use error::{err, Error, ErrorKind, Result};
