pub mod execution_repository;
pub mod mock_db;
pub mod postgres_execution_repository;
pub mod postgres_schedule_repository;
pub mod postgres_workflow_repository;
pub mod schedule_repository;
pub mod workflow_repository;
