//! Whole-block sorting by a multi-column sort description.

use std::cmp::Ordering;

use strata_error::Result;
use strata_types::{SortDescription, SortDirection};

use crate::block::Block;
use crate::column::{Column, Permutation};

/// A stable permutation ordering the block's rows by `description`.
pub fn sort_permutation_for_block(
    block: &Block,
    description: &SortDescription,
) -> Result<Permutation> {
    let mut key_columns: Vec<(&Column, SortDirection, i8)> = Vec::with_capacity(description.len());
    for sort_col in description {
        let col = block.by_name(&sort_col.name)?;
        key_columns.push((&col.column, sort_col.direction, sort_col.nan_direction_hint));
    }

    let mut perm: Permutation = (0..block.rows()).collect();
    perm.sort_by(|&a, &b| {
        for &(col, direction, nan_hint) in &key_columns {
            let ord = direction.apply(col.compare_at(a, col, b, nan_hint));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(perm)
}

/// Sort the block's rows; `limit = 0` keeps all rows.
pub fn sort_block(block: &Block, description: &SortDescription, limit: usize) -> Result<Block> {
    if block.rows() <= 1 {
        return Ok(block.clone());
    }
    let perm = sort_permutation_for_block(block, description)?;
    block.permute_rows(&perm, limit)
}

/// Whether consecutive rows of the block respect the sort description.
pub fn blocks_are_sorted(block: &Block, description: &SortDescription) -> Result<bool> {
    for row in 1..block.rows() {
        for sort_col in description {
            let col = &block.by_name(&sort_col.name)?.column;
            let ord = sort_col
                .direction
                .apply(col.compare_at(row - 1, col, row, sort_col.nan_direction_hint));
            match ord {
                Ordering::Less => break,
                Ordering::Equal => continue,
                Ordering::Greater => return Ok(false),
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ColumnWithTypeAndName;
    use crate::string::StringColumn;
    use strata_types::{DataType, Field, SortColumnDescription};

    fn sample() -> Block {
        let mut s = StringColumn::new();
        s.push(b"x");
        s.push(b"y");
        s.push(b"z");
        s.push(b"w");
        Block::from_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::UInt64, Column::UInt64(vec![2, 1, 2, 1])),
            ColumnWithTypeAndName::new("s", DataType::String, Column::String(s)),
        ])
        .expect("block")
    }

    #[test]
    fn test_sort_single_key_stable() {
        let block = sample();
        let sorted = sort_block(&block, &vec![SortColumnDescription::ascending("k")], 0)
            .expect("sort");
        // Ties keep input order: (1,"y"), (1,"w"), (2,"x"), (2,"z").
        assert_eq!(sorted.by_position(1).column.field_at(0), Field::from("y"));
        assert_eq!(sorted.by_position(1).column.field_at(1), Field::from("w"));
        assert_eq!(sorted.by_position(0).column.field_at(3), Field::UInt64(2));
        assert!(blocks_are_sorted(&sorted, &vec![SortColumnDescription::ascending("k")])
            .expect("check"));
    }

    #[test]
    fn test_sort_two_keys_with_direction() {
        let block = sample();
        let description = vec![
            SortColumnDescription::ascending("k"),
            SortColumnDescription::descending("s"),
        ];
        let sorted = sort_block(&block, &description, 0).expect("sort");
        assert_eq!(sorted.by_position(1).column.field_at(0), Field::from("y"));
        assert_eq!(sorted.by_position(1).column.field_at(2), Field::from("z"));
        assert!(blocks_are_sorted(&sorted, &description).expect("check"));
    }

    #[test]
    fn test_sort_with_limit() {
        let block = sample();
        let sorted = sort_block(&block, &vec![SortColumnDescription::ascending("k")], 2)
            .expect("sort");
        assert_eq!(sorted.rows(), 2);
        assert_eq!(sorted.by_position(0).column.field_at(0), Field::UInt64(1));
    }
}
