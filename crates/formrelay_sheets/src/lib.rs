pub mod google;
pub mod memory;
pub mod writer;

pub use google::{GoogleSheetsConfig, GoogleSheetsWriter, ServiceAccountCredentials};
pub use memory::InMemorySheetWriter;
pub use writer::{AppendReceipt, SheetWriter, WriteError};
