pub mod migration_options;
pub mod migration_result;
pub mod migrator;
pub mod retry;
pub mod table_migrator;
pub mod table_schema_mapper;
