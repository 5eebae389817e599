use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    BadAppName { app_name: String },
    InvalidOption { option: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &'static str {
        match self {
            AppError::BadAppName { .. } => "app/bad-app-name",
            AppError::InvalidOption { .. } => "app/invalid-option",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadAppName { app_name } => {
                write!(f, "Illegal app name: '{app_name}' ({})", self.code_str())
            }
            AppError::InvalidOption { option, message } => {
                write!(f, "Invalid option {option}: {message} ({})", self.code_str())
            }
        }
    }
}

impl std::error::Error for AppError {}
