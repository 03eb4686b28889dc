pub mod attempt_dto;
pub mod review_dto;
