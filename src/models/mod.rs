pub mod entity;
pub mod form_state;
pub mod loaders;
pub mod papeletas;
pub mod raw_result;
pub mod record;
pub mod source;

pub use entity::{GroupCount, GroupedCounts, Page, PersistedEntity, RecentEntry, StoreStats, UpsertAction, UpsertOutcome};
pub use form_state::{FormLayout, SessionFormState, EVENT_VALIDATION, SCPPP_FORM, VIEWSTATE};
pub use loaders::{load_batch_file, BatchQuery};
pub use papeletas::{PapeletasStatus, PapeletasSummary};
pub use raw_result::RawResult;
pub use record::{normalize_field_key, ColumnKind, ExtractedRecord, FieldSpec, RecordSchema, NOT_FOUND};
pub use source::{SearchMode, Source, DRIVER_SCHEMA, VEHICLE_SCHEMA};
