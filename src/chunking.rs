use crate::error::{MosaicError, Result};
use log::debug;

/// One rectangular region of the output grid, `[row_start, row_end) x
/// [col_start, col_end)` in output pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub index: usize,
    // Block coordinates within the grid
    pub block_row: usize,
    pub block_col: usize,

    // Pixel window
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl Block {
    pub fn width(&self) -> usize {
        self.col_end - self.col_start
    }

    pub fn height(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn pixel_count(&self) -> usize {
        self.width() * self.height()
    }
}

/// Partition of a raster into non-overlapping square blocks; edge blocks are
/// truncated to the raster.
#[derive(Debug, Clone)]
pub struct BlockGrid {
    raster_width: usize,
    raster_height: usize,
    block_size: usize,
    pub blocks_x: usize,
    pub blocks_y: usize,
    pub total_blocks: usize,
}

impl BlockGrid {
    pub fn new(raster_width: usize, raster_height: usize, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(MosaicError::InvalidBlockSize(block_size));
        }

        let blocks_x = raster_width.div_ceil(block_size);
        let blocks_y = raster_height.div_ceil(block_size);
        let total_blocks = blocks_x * blocks_y;

        debug!(
            "BlockGrid: {}x{} raster, block_size={} → {}x{} blocks ({} total)",
            raster_width, raster_height, block_size, blocks_x, blocks_y, total_blocks
        );

        Ok(Self {
            raster_width,
            raster_height,
            block_size,
            blocks_x,
            blocks_y,
            total_blocks,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn iter(&self) -> BlockIterator<'_> {
        BlockIterator::new(self)
    }

    /// Block by linear index (row-major over block coordinates).
    pub fn block(&self, index: usize) -> Block {
        let block_row = index / self.blocks_x;
        let block_col = index % self.blocks_x;

        let row_start = block_row * self.block_size;
        let col_start = block_col * self.block_size;
        let row_end = ((block_row + 1) * self.block_size).min(self.raster_height);
        let col_end = ((block_col + 1) * self.block_size).min(self.raster_width);

        Block {
            index,
            block_row,
            block_col,
            row_start,
            row_end,
            col_start,
            col_end,
        }
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.iter().collect()
    }
}

pub struct BlockIterator<'a> {
    grid: &'a BlockGrid,
    current_idx: usize,
}

impl<'a> BlockIterator<'a> {
    fn new(grid: &'a BlockGrid) -> Self {
        Self {
            grid,
            current_idx: 0,
        }
    }
}

impl Iterator for BlockIterator<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx < self.grid.total_blocks {
            let block = self.grid.block(self.current_idx);
            self.current_idx += 1;
            Some(block)
        } else {
            None
        }
    }
}
