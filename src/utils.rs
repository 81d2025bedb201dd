//! Utilities for the binary frontend.
//!
//! These functions are used to parse command line arguments.

use std::{iter, num::ParseIntError};

use either::Either;
use thiserror::Error;

/// Parses ranges from strings into discrete steps.
pub fn parse_ranges<'a>(
	ranges: impl IntoIterator<Item = &'a str> + 'a,
) -> impl Iterator<Item = Result<usize, ParseIntError>> + 'a {
	ranges
		.into_iter()
		.map(|range| {
			let range = match range.split_once('-') {
				Some((start, end)) => start.parse()?..=end.parse()?,
				None => {
					let idx = range.parse()?;
					idx..=idx
				}
			};
			Ok(range)
		})
		.flat_map(|range| match range {
			Ok(range) => Either::Left(range.map(Ok)),
			Err(err) => Either::Right(iter::once(Err(err))),
		})
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseCpuListError {
	#[error(transparent)]
	Parse(#[from] ParseIntError),

	#[error("Available cores: {available:?}, requested cores: {requested:?}")]
	Unavailable {
		available: Vec<usize>,
		requested: Vec<usize>,
	},
}

/// Parses a list of CPU numbers separated by commas or spaces, deduplicated and sorted.
///
/// Every CPU must be one of `available`.
pub fn parse_cpu_list(list: &str, available: &[usize]) -> Result<Vec<usize>, ParseCpuListError> {
	let mut requested = parse_ranges(list.split([' ', ',']).filter(|s| !s.is_empty()))
		.collect::<Result<Vec<_>, _>>()?;
	requested.sort_unstable();
	requested.dedup();

	if !requested.iter().all(|cpu| available.contains(cpu)) {
		return Err(ParseCpuListError::Unavailable {
			available: available.to_vec(),
			requested,
		});
	}
	Ok(requested)
}
