//! Dataspace and selection tests: extents, block validation and the
//! row-major byte runs every layout consumes.

#[cfg(test)]
mod tests {
    use crate::layout::{Dataspace, Hyperslab, LayoutError, Selection, SpaceClass};

    #[test]
    fn test_npoints_by_class() {
        assert_eq!(Dataspace::scalar().npoints(), Some(1));
        assert_eq!(Dataspace::null().npoints(), Some(0));
        assert_eq!(Dataspace::simple(&[3, 4, 5]).npoints(), Some(60));
        assert_eq!(Dataspace::simple(&[u64::MAX, 2]).npoints(), None);
    }

    #[test]
    fn test_extendible_detection() {
        assert!(!Dataspace::simple(&[4, 4]).is_extendible());

        let unlimited = Dataspace::extendible(&[4, 4], &[None, Some(4)]).unwrap();
        assert!(unlimited.is_extendible());
        assert_eq!(unlimited.class(), SpaceClass::Simple);

        let bounded = Dataspace::extendible(&[4], &[Some(8)]).unwrap();
        assert!(bounded.is_extendible());

        let fixed = Dataspace::extendible(&[4], &[Some(4)]).unwrap();
        assert!(!fixed.is_extendible());
    }

    #[test]
    fn test_extendible_rejects_bad_max() {
        assert!(matches!(
            Dataspace::extendible(&[4, 4], &[Some(4)]),
            Err(LayoutError::Selection(_))
        ));
        assert!(matches!(
            Dataspace::extendible(&[8], &[Some(4)]),
            Err(LayoutError::Selection(_))
        ));
    }

    #[test]
    fn test_full_selection_is_one_run() {
        let space = Dataspace::simple(&[4, 6]);
        assert_eq!(Selection::All.byte_runs(&space, 8), vec![(0, 192)]);
        assert_eq!(Selection::All.npoints(&space), 24);
    }

    #[test]
    fn test_block_rows_are_row_major() {
        let space = Dataspace::simple(&[4, 6]);
        let sel = Selection::Block(Hyperslab::new(&[1, 2], &[2, 3]));
        sel.validate(&space).unwrap();
        // Rows start at elements 8 and 14.
        assert_eq!(sel.byte_runs(&space, 2), vec![(16, 6), (28, 6)]);
        assert_eq!(sel.npoints(&space), 6);
    }

    #[test]
    fn test_full_width_block_merges_rows() {
        let space = Dataspace::simple(&[4, 6]);
        let sel = Selection::Block(Hyperslab::new(&[1, 0], &[2, 6]));
        assert_eq!(sel.byte_runs(&space, 1), vec![(6, 12)]);
    }

    #[test]
    fn test_block_outside_extent_rejected() {
        let space = Dataspace::simple(&[4, 6]);
        let sel = Selection::Block(Hyperslab::new(&[3, 0], &[2, 1]));
        assert!(matches!(sel.validate(&space), Err(LayoutError::Selection(_))));

        let wrong_rank = Selection::Block(Hyperslab::new(&[0], &[1]));
        assert!(matches!(wrong_rank.validate(&space), Err(LayoutError::Selection(_))));
    }

    #[test]
    fn test_empty_selections() {
        let space = Dataspace::simple(&[4]);
        assert!(Selection::None.byte_runs(&space, 4).is_empty());
        assert_eq!(Selection::None.npoints(&space), 0);

        let empty_block = Selection::Block(Hyperslab::new(&[2], &[0]));
        assert!(empty_block.region(&space).is_none());
        assert_eq!(Selection::All.npoints(&Dataspace::null()), 0);
    }

    #[test]
    fn test_scalar_selection() {
        let space = Dataspace::scalar();
        assert_eq!(Selection::All.byte_runs(&space, 4), vec![(0, 4)]);
    }

    #[test]
    fn test_intersect() {
        let a = Hyperslab::new(&[0, 0], &[4, 4]);
        let b = Hyperslab::new(&[2, 3], &[4, 4]);
        assert_eq!(a.intersect(&b), Some(Hyperslab::new(&[2, 3], &[2, 1])));

        let c = Hyperslab::new(&[4, 0], &[1, 1]);
        assert_eq!(a.intersect(&c), None);
    }
}
