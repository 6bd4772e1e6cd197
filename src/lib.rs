pub mod calibration;
pub mod config;
pub mod decision;
pub mod dixon_coles;
pub mod ensemble;
pub mod error;
pub mod features;
pub mod feed;
pub mod gbm;
pub mod history;
pub mod lambdas;
pub mod league_params;
pub mod ledger;
pub mod market;
pub mod optimizer;
pub mod persist;
pub mod pipeline;
pub mod predictor;
pub mod scoreline;
pub mod synthetic;
pub mod team_stats;
