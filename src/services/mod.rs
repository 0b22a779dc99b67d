pub mod captcha;
pub mod extractor;
pub mod ocr;
pub mod store;
pub mod vision;

pub use captcha::{normalize_captcha, CaptchaAdapter, CaptchaChallenge, Recognizer};
pub use extractor::{Extraction, ExtractionOutput, MarkupExtraction, VisionLabelExtraction};
pub use ocr::TesseractRecognizer;
pub use store::RecordStore;
pub use vision::{VisionRecognizer, VisionService};
