//! Preallocated row store shared between one writer and any number of readers.
//!
//! Values are kept as `f64` bit patterns in atomics so a reader never needs a lock: the
//! writer fills a whole row, then publishes it by advancing `write_cursor` with release
//! ordering. Readers load the cursor with acquire ordering and only touch slots below it.

use crate::{DaqError, Result};
use ndarray::Array2;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Arena {
    slots: Box<[AtomicU64]>,
    row_width: usize,
    capacity_rows: usize,
    /// Next free flat index. Only ever moves forward, in whole rows.
    write_cursor: AtomicUsize,
}

impl Arena {
    fn load(&self, index: usize) -> f64 {
        f64::from_bits(self.slots[index].load(Ordering::Relaxed))
    }

    fn written_rows(&self) -> usize {
        self.write_cursor.load(Ordering::Acquire) / self.row_width
    }
}

/// Read side of an acquisition buffer. Cheap to clone and safe to use from any thread
/// while the run that owns the [`RowWriter`] is still appending.
#[derive(Debug, Clone)]
pub struct AcquisitionBuffer {
    arena: Arc<Arena>,
}

/// The single write side of an acquisition buffer.
#[derive(Debug)]
pub struct RowWriter {
    arena: Arc<Arena>,
}

/// Row selections offered to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    All,
    /// The last `num_rows` written rows.
    Relative { num_rows: usize },
    /// Rows `[start, end)`, with `end` clipped to the written rows.
    Range { start: i64, end: i64 },
}

impl AcquisitionBuffer {
    /// Allocates `capacity_rows * row_width` slots and hands back both halves.
    pub fn allocate(capacity_rows: usize, row_width: usize) -> Result<(Self, RowWriter)> {
        if capacity_rows == 0 {
            return Err(DaqError::validation("buffer capacity must be at least one row"));
        }
        if row_width == 0 {
            return Err(DaqError::validation("buffer rows must be at least one value wide"));
        }
        let len = capacity_rows.checked_mul(row_width).ok_or_else(|| {
            DaqError::validation(format!(
                "{} rows of width {} do not fit in memory",
                capacity_rows, row_width
            ))
        })?;
        let slots = (0..len).map(|_| AtomicU64::new(0)).collect();
        let arena = Arc::new(Arena {
            slots,
            row_width,
            capacity_rows,
            write_cursor: AtomicUsize::new(0),
        });
        Ok((
            Self {
                arena: Arc::clone(&arena),
            },
            RowWriter { arena },
        ))
    }

    /// Number of fully written rows.
    pub fn row_count(&self) -> usize {
        self.arena.written_rows()
    }

    pub fn capacity_rows(&self) -> usize {
        self.arena.capacity_rows
    }

    pub fn row_width(&self) -> usize {
        self.arena.row_width
    }

    pub fn is_full(&self) -> bool {
        self.row_count() >= self.arena.capacity_rows
    }

    /// Copies rows `[from_row, to_row)`, clipped to what has been written.
    pub fn window(&self, from_row: usize, to_row: usize) -> Array2<f64> {
        let width = self.arena.row_width;
        let end = to_row.min(self.row_count());
        let rows = end.saturating_sub(from_row);
        Array2::from_shape_fn((rows, width), |(r, c)| {
            self.arena.load((from_row + r) * width + c)
        })
    }

    pub fn row(&self, index: usize) -> Option<Vec<f64>> {
        if index >= self.row_count() {
            return None;
        }
        let width = self.arena.row_width;
        Some((0..width).map(|c| self.arena.load(index * width + c)).collect())
    }

    pub fn last_row(&self) -> Option<Vec<f64>> {
        self.row_count().checked_sub(1).and_then(|i| self.row(i))
    }

    pub fn select(&self, selection: Selection) -> Result<Array2<f64>> {
        let written = self.row_count();
        match selection {
            Selection::All => Ok(self.window(0, written)),
            Selection::Relative { num_rows } => {
                if num_rows > written {
                    return Err(DaqError::validation(format!(
                        "asked for the last {} rows but only {} are written",
                        num_rows, written
                    )));
                }
                Ok(self.window(written - num_rows, written))
            }
            Selection::Range { start, end } => {
                if start < 0 || start >= end {
                    return Err(DaqError::validation(format!(
                        "invalid range [{}, {})",
                        start, end
                    )));
                }
                Ok(self.window(start as usize, end as usize))
            }
        }
    }
}

impl RowWriter {
    /// Writes one full row and publishes it. Returns the row's index.
    pub fn append_row(&mut self, values: &[f64]) -> Result<usize> {
        let arena = &self.arena;
        if values.len() != arena.row_width {
            return Err(DaqError::RowWidth {
                expected: arena.row_width,
                actual: values.len(),
            });
        }
        // Only this writer moves the cursor, so a relaxed load sees its own last store.
        let cursor = arena.write_cursor.load(Ordering::Relaxed);
        if cursor + arena.row_width > arena.slots.len() {
            return Err(DaqError::BufferFull {
                capacity_rows: arena.capacity_rows,
            });
        }
        for (slot, value) in arena.slots[cursor..cursor + arena.row_width]
            .iter()
            .zip(values)
        {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
        arena
            .write_cursor
            .store(cursor + arena.row_width, Ordering::Release);
        Ok(cursor / arena.row_width)
    }

    /// Builds the row from a scan and its two timestamps without an intermediate copy
    /// on the caller's side.
    pub fn append_scan(&mut self, readings: &[f64], device_time: f64, host_time: f64) -> Result<usize> {
        let mut row = Vec::with_capacity(readings.len() + 2);
        row.extend_from_slice(readings);
        row.push(device_time);
        row.push(host_time);
        self.append_row(&row)
    }

    pub fn remaining_rows(&self) -> usize {
        self.arena.capacity_rows - self.arena.written_rows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;

    fn filled(rows: usize, width: usize) -> (AcquisitionBuffer, RowWriter) {
        let (buffer, mut writer) = AcquisitionBuffer::allocate(rows + 4, width).unwrap();
        for r in 0..rows {
            let row: Vec<f64> = (0..width).map(|c| (r * 10 + c) as f64).collect();
            writer.append_row(&row).unwrap();
        }
        (buffer, writer)
    }

    #[test]
    fn allocate_rejects_zero_capacity() {
        assert!(AcquisitionBuffer::allocate(0, 3).unwrap_err().is_validation());
        assert!(AcquisitionBuffer::allocate(3, 0).unwrap_err().is_validation());
    }

    #[test]
    fn rows_come_back_in_append_order() {
        let (buffer, _writer) = filled(5, 3);
        let all = buffer.window(0, 5);
        assert_eq!(all.dim(), (5, 3));
        for r in 0..5 {
            assert_eq!(all.row(r).to_vec(), vec![(r * 10) as f64, (r * 10 + 1) as f64, (r * 10 + 2) as f64]);
        }
    }

    #[test]
    fn window_is_clipped_and_idempotent() {
        let (buffer, _writer) = filled(4, 2);
        assert_eq!(buffer.window(2, 100).dim(), (2, 2));
        assert_eq!(buffer.window(7, 9).dim(), (0, 2));
        assert_eq!(buffer.window(3, 1).dim(), (0, 2));
        assert_eq!(buffer.window(1, 3), buffer.window(1, 3));
    }

    #[test]
    fn empty_buffer_reads_nothing() {
        let (buffer, _writer) = AcquisitionBuffer::allocate(4, 3).unwrap();
        assert_eq!(buffer.row_count(), 0);
        assert_eq!(buffer.window(0, 4).dim(), (0, 3));
        assert_eq!(buffer.last_row(), None);
    }

    #[test]
    fn append_past_capacity_fails_without_moving_cursor() {
        let (buffer, mut writer) = AcquisitionBuffer::allocate(2, 2).unwrap();
        writer.append_row(&[1.0, 2.0]).unwrap();
        writer.append_row(&[3.0, 4.0]).unwrap();
        assert!(matches!(
            writer.append_row(&[5.0, 6.0]),
            Err(DaqError::BufferFull { capacity_rows: 2 })
        ));
        assert!(matches!(
            writer.append_row(&[5.0]),
            Err(DaqError::RowWidth { expected: 2, actual: 1 })
        ));
        assert_eq!(buffer.row_count(), 2);
        assert!(buffer.is_full());
        assert_eq!(writer.remaining_rows(), 0);
    }

    #[test]
    fn selections() {
        let (buffer, _writer) = filled(10, 3);
        assert_eq!(buffer.select(Selection::All).unwrap().dim(), (10, 3));
        let last = buffer.select(Selection::Relative { num_rows: 5 }).unwrap();
        assert_eq!(last.dim(), (5, 3));
        assert_eq!(last[[0, 0]], 50.0);
        assert_eq!(
            buffer.select(Selection::Range { start: 2, end: 4 }).unwrap().dim(),
            (2, 3)
        );
        assert!(buffer.select(Selection::Relative { num_rows: 12 }).is_err());
        for (start, end) in [(5, 3), (4, 4), (-30, 4)] {
            let err = buffer.select(Selection::Range { start, end }).unwrap_err();
            assert!(err.is_validation());
        }
    }

    #[test]
    fn append_scan_adds_time_columns() {
        let (buffer, mut writer) = AcquisitionBuffer::allocate(1, 4).unwrap();
        assert_eq!(writer.append_scan(&[1.5, 2.5], 0.1, 0.2).unwrap(), 0);
        assert_eq!(buffer.row(0), Some(vec![1.5, 2.5, 0.1, 0.2]));
    }

    #[test]
    fn readers_never_see_partial_rows() {
        let width = 8;
        let rows = 20_000;
        let (buffer, mut writer) = AcquisitionBuffer::allocate(rows, width).unwrap();
        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                while !buffer.is_full() {
                    if let Some(row) = buffer.last_row() {
                        assert!(row.iter().all(|&v| v == row[0]));
                    }
                }
            })
        };
        for r in 0..rows {
            writer.append_row(&vec![r as f64; width]).unwrap();
        }
        reader.join().unwrap();
        assert_eq!(buffer.row_count(), rows);
    }
}
