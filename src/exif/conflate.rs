//! Collapses a batch of pending operations into the minimal set worth writing.
//!
//! * Keywords: per image and exact keyword text, only the latest operation survives.
//! * Caption, description, copyright and rating: only the latest per image and field.
//! * Rotations: summed per image into one new net rotation; every input is discarded.
//! * Faces: kept as they are.
//!
//! Every input ends up either in the output or in `discarded`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::db::{ExifOperation, ExifType, OperationType, WriteState};

#[derive(Debug, Default)]
pub struct Conflated {
    /// Surviving operations per image: keywords, then faces, then single-valued
    /// fields, then rotation.
    pub by_image: BTreeMap<i64, Vec<ExifOperation>>,
    /// Superseded operations, already set to [`WriteState::Discarded`].
    pub discarded: Vec<ExifOperation>,
}

fn order_key(op: &ExifOperation) -> (DateTime<Utc>, Option<i64>) {
    (op.timestamp, op.id)
}

/// Keep the latest operation of each group and discard the rest.
fn latest_per_group<K: Ord>(
    ops: Vec<ExifOperation>,
    key: impl Fn(&ExifOperation) -> K,
    discarded: &mut Vec<ExifOperation>,
) -> Vec<ExifOperation> {
    let mut groups: BTreeMap<K, Vec<ExifOperation>> = BTreeMap::new();
    for op in ops {
        groups.entry(key(&op)).or_default().push(op);
    }

    let mut survivors = Vec::new();
    for (_, mut group) in groups {
        group.sort_by_key(order_key);
        if let Some(latest) = group.pop() {
            survivors.push(latest);
        }
        discarded.extend(group);
    }
    survivors.sort_by_key(order_key);
    survivors
}

/// Parse a rotation in degrees. Text that is not a whole number contributes nothing.
fn rotation_degrees(op: &ExifOperation) -> i64 {
    op.text.trim().parse::<i64>().unwrap_or(0)
}

pub fn conflate(ops: Vec<ExifOperation>) -> Conflated {
    let mut keywords = Vec::new();
    let mut faces = Vec::new();
    let mut singles = Vec::new();
    let mut rotations = Vec::new();

    for op in ops {
        match op.exif_type {
            ExifType::Keyword => keywords.push(op),
            ExifType::Face => faces.push(op),
            ExifType::Rotate => rotations.push(op),
            _ => singles.push(op),
        }
    }

    let mut discarded = Vec::new();
    let keywords = latest_per_group(keywords, |op| (op.image_id, op.text.clone()), &mut discarded);
    let singles = latest_per_group(singles, |op| (op.image_id, op.exif_type), &mut discarded);
    faces.sort_by_key(order_key);

    let mut by_image: BTreeMap<i64, Vec<ExifOperation>> = BTreeMap::new();
    for op in keywords.into_iter().chain(faces).chain(singles) {
        by_image.entry(op.image_id).or_default().push(op);
    }

    let mut rotations_by_image: BTreeMap<i64, Vec<ExifOperation>> = BTreeMap::new();
    for op in rotations {
        rotations_by_image.entry(op.image_id).or_default().push(op);
    }
    for (image_id, group) in rotations_by_image {
        let total: i64 = group.iter().map(rotation_degrees).sum();
        let Some(latest) = group.iter().max_by_key(|op| order_key(op)) else {
            continue;
        };

        let net = ExifOperation {
            id: None,
            image_id,
            exif_type: ExifType::Rotate,
            operation: OperationType::Add,
            text: total.rem_euclid(360).to_string(),
            timestamp: latest.timestamp,
            state: WriteState::Pending,
            user_id: latest.user_id,
        };
        by_image.entry(image_id).or_default().push(net);
        discarded.extend(group);
    }

    for op in &mut discarded {
        op.state = WriteState::Discarded;
    }

    Conflated { by_image, discarded }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn op(
        id: i64,
        image_id: i64,
        exif_type: ExifType,
        operation: OperationType,
        text: &str,
        second: i64,
    ) -> ExifOperation {
        ExifOperation {
            id: Some(id),
            image_id,
            exif_type,
            operation,
            text: text.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
                + Duration::seconds(second),
            state: WriteState::Pending,
            user_id: None,
        }
    }

    #[test]
    fn test_keyword_latest_wins() {
        let ops = vec![
            op(1, 10, ExifType::Keyword, OperationType::Add, "cat", 1),
            op(2, 10, ExifType::Keyword, OperationType::Add, "cat", 2),
            op(3, 10, ExifType::Keyword, OperationType::Remove, "cat", 3),
        ];

        let result = conflate(ops);
        let survivors = &result.by_image[&10];
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, Some(3));
        assert_eq!(survivors[0].operation, OperationType::Remove);

        let mut discarded: Vec<i64> = result.discarded.iter().filter_map(|o| o.id).collect();
        discarded.sort();
        assert_eq!(discarded, vec![1, 2]);
        assert!(result.discarded.iter().all(|o| o.state == WriteState::Discarded));
    }

    #[test]
    fn test_keywords_are_independent_and_case_sensitive() {
        let ops = vec![
            op(1, 10, ExifType::Keyword, OperationType::Add, "cat", 1),
            op(2, 10, ExifType::Keyword, OperationType::Add, "Cat", 2),
            op(3, 10, ExifType::Keyword, OperationType::Remove, "dog", 3),
            op(4, 11, ExifType::Keyword, OperationType::Add, "cat", 4),
        ];

        let result = conflate(ops);
        assert_eq!(result.by_image[&10].len(), 3);
        assert_eq!(result.by_image[&11].len(), 1);
        assert!(result.discarded.is_empty());
    }

    #[test]
    fn test_rotation_nets_to_single_add() {
        let values = [90, 180, -90, 90, -270, 90];
        let ops: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let text = v.to_string();
                op(i as i64 + 1, 5, ExifType::Rotate, OperationType::Add, &text, i as i64)
            })
            .collect();

        let result = conflate(ops);
        let survivors = &result.by_image[&5];
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, None);
        assert_eq!(survivors[0].operation, OperationType::Add);
        assert_eq!(survivors[0].text, "90");
        assert_eq!(result.discarded.len(), 6);
    }

    #[test]
    fn test_negative_net_rotation_normalised() {
        let ops = vec![
            op(1, 5, ExifType::Rotate, OperationType::Add, "-90", 1),
            op(2, 5, ExifType::Rotate, OperationType::Add, "-360", 2),
        ];
        let result = conflate(ops);
        assert_eq!(result.by_image[&5][0].text, "270");
    }

    #[test]
    fn test_single_fields_and_faces() {
        let ops = vec![
            op(1, 1, ExifType::Caption, OperationType::Add, "first", 1),
            op(2, 1, ExifType::Caption, OperationType::Add, "second", 5),
            op(3, 1, ExifType::Rating, OperationType::Add, "4", 2),
            op(4, 1, ExifType::Face, OperationType::Add, "{}", 3),
            op(5, 1, ExifType::Face, OperationType::Add, "{}", 3),
            op(6, 1, ExifType::Keyword, OperationType::Add, "sea", 9),
            op(7, 1, ExifType::Rotate, OperationType::Add, "90", 0),
        ];

        let result = conflate(ops);
        let kinds: Vec<(ExifType, Option<i64>)> = result.by_image[&1]
            .iter()
            .map(|o| (o.exif_type, o.id))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ExifType::Keyword, Some(6)),
                (ExifType::Face, Some(4)),
                (ExifType::Face, Some(5)),
                (ExifType::Rating, Some(3)),
                (ExifType::Caption, Some(2)),
                (ExifType::Rotate, None),
            ]
        );
        let discarded: Vec<Option<i64>> = result.discarded.iter().map(|o| o.id).collect();
        assert_eq!(discarded, vec![Some(1), Some(7)]);
    }
}
