//! Grade aggregation and at-risk prediction for class rosters.
//!
//! A run reads the first table of a document, turns letter grades into
//! averages and study advice, trains a shallow decision tree on the averages
//! and renders the result as an HTML table and an Excel workbook.

pub mod classifier;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod grades;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod risk;
