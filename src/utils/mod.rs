pub mod image;
pub mod url_signing;
