mod declaration;

pub use declaration::DeclarationFileFrontend;
