mod client;
mod token;

pub use client::{
    ApiErrorClass, CopyJob, CopyJobOptions, CopyJobState, CopyJobStatus, ItemPage, LibraryClient,
    LibraryError, ListInfo, ListItem, NameConflictBehavior,
};
pub use token::{AccessToken, TokenClient, TokenError};
