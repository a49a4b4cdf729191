use std::sync::Arc;

use image::GrayImage;

use super::{Pipe, configured};
use crate::{
    backend::{BoardParams, VisionBackend},
    error::{ParamError, VisionError},
    geometry::Point,
};

const STAGE: &str = "find board corners";

#[derive(Clone, Debug, PartialEq)]
pub struct FindBoardCornersParams {
    pub board: BoardParams,
}

pub struct FindBoardCornersPipe {
    backend: Arc<dyn VisionBackend>,
    params: Option<FindBoardCornersParams>,
}

impl FindBoardCornersPipe {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            backend,
            params: None,
        }
    }
}

impl<'a> Pipe<&'a GrayImage> for FindBoardCornersPipe {
    type Output = Option<Vec<Point>>;
    type Params = FindBoardCornersParams;

    fn set_params(&mut self, params: FindBoardCornersParams) -> Result<(), VisionError> {
        let board = &params.board;
        if board.columns < 2 || board.rows < 2 {
            return Err(ParamError::out_of_range(
                STAGE,
                "board inner corners",
                "columns >= 2 and rows >= 2",
                board.columns.min(board.rows),
            )
            .into());
        }
        if board.square_size_m <= 0.0 {
            return Err(
                ParamError::out_of_range(STAGE, "square_size_m", "x > 0", board.square_size_m)
                    .into(),
            );
        }
        self.params = Some(params);
        Ok(())
    }

    fn process(&mut self, image: &'a GrayImage) -> Result<Option<Vec<Point>>, VisionError> {
        let params = configured(&self.params, STAGE)?;
        let corners = self.backend.find_board_corners(image, &params.board)?;
        Ok(corners.filter(|c| c.len() == params.board.corner_count()))
    }
}
