//! HTTP client for the external pose-solving service.
//!
//! The solver is an opaque matcher: it receives the live query image paired
//! with the aligned reference stack and returns either a rotation and
//! translation in the aligned-image frame or an explicit no-match. Endpoint
//! address and timeout are configuration; everything that can go wrong on
//! this boundary collapses into [`SolverError`] and is handled by the caller
//! as a missing estimate for the cycle.

use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::types::{QueryImage, RawPoseEstimate};

#[derive(Debug, Clone)]
pub enum SolverError {
    NetworkTimeout,
    HttpError(u16),
    /// Solver answered but found no match between query and reference
    NoMatch,
    MalformedResponse(String),
    RequestFailed(String),
}

impl Display for SolverError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            SolverError::NetworkTimeout => write!(f, "solver request timed out"),
            SolverError::HttpError(code) => write!(f, "solver HTTP error: {}", code),
            SolverError::NoMatch => write!(f, "solver reported no match"),
            SolverError::MalformedResponse(msg) => write!(f, "malformed solver response: {}", msg),
            SolverError::RequestFailed(msg) => write!(f, "solver request failed: {}", msg),
        }
    }
}

/// Wire request: the query frame plus the aligned reference stack, channels
/// split out, all row-major bytes.
#[derive(Serialize)]
struct SolveRequest {
    height: usize,
    width: usize,
    query: Vec<u8>,
    reference: Vec<u8>,
    /// Interleaved lo/hi bytes of the 16-bit elevation raster
    elevation: Vec<u8>,
}

#[derive(Deserialize)]
struct SolveResponse {
    matched: bool,
    rotation: Option<[[f64; 3]; 3]>,
    translation: Option<[f64; 3]>,
}

pub struct PoseSolverClient {
    client: reqwest::Client,
    endpoint: String,
}

impl PoseSolverClient {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        PoseSolverClient {
            client,
            endpoint: endpoint.to_string(),
        }
    }

    /// One blocking round trip to the solver.
    pub async fn solve(
        &self,
        query: &QueryImage,
        aligned: &Array3<u8>,
    ) -> Result<RawPoseEstimate, SolverError> {
        let request = build_request(query, aligned);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SolverError::NetworkTimeout
                } else {
                    SolverError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SolverError::HttpError(status.as_u16()));
        }

        let body: SolveResponse = response
            .json()
            .await
            .map_err(|e| SolverError::MalformedResponse(e.to_string()))?;
        estimate_from_response(body)
    }
}

fn build_request(query: &QueryImage, aligned: &Array3<u8>) -> SolveRequest {
    let reference: Vec<u8> = aligned.index_axis(Axis(2), 0).iter().copied().collect();
    let (h, w) = (aligned.shape()[0], aligned.shape()[1]);
    let mut elevation = Vec::with_capacity(h * w * 2);
    for r in 0..h {
        for c in 0..w {
            elevation.push(aligned[[r, c, 1]]);
            elevation.push(aligned[[r, c, 2]]);
        }
    }
    SolveRequest {
        height: query.height(),
        width: query.width(),
        query: query.data.iter().copied().collect(),
        reference,
        elevation,
    }
}

fn estimate_from_response(body: SolveResponse) -> Result<RawPoseEstimate, SolverError> {
    if !body.matched {
        return Err(SolverError::NoMatch);
    }
    let (r, t) = match (body.rotation, body.translation) {
        (Some(r), Some(t)) => (r, t),
        _ => {
            return Err(SolverError::MalformedResponse(
                "matched response missing rotation or translation".to_string(),
            ))
        }
    };
    Ok(RawPoseEstimate {
        rotation: Matrix3::new(
            r[0][0], r[0][1], r[0][2], //
            r[1][0], r[1][1], r[1][2], //
            r[2][0], r[2][1], r[2][2],
        ),
        translation: Vector3::new(t[0], t[1], t[2]),
    })
}
