//! Tile message parsing and geometry.
//!
//! Tile requests travel as plain text: a `tile ` or `tilecombine` prefix
//! followed by whitespace-separated `key=value` tokens. The queue layer
//! parses them just enough to deduplicate requests and to decide whether a
//! tile is close to a user's cursor.

use crate::error::Error;

/// A view's cursor rectangle, in document coordinates.
///
/// Zero width or height describes a collapsed cursor that intersects
/// nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorPosition {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CursorPosition {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> CursorPosition {
        CursorPosition {
            x,
            y,
            width,
            height,
        }
    }
}

/// A parsed tile request.
///
/// Carries the rectangle the tile covers and the optional `id=` tag that
/// marks out-of-band requests (previews and the like) which must survive
/// `canceltiles`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDescriptor {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    version: Option<u32>,
    id: Option<String>,
}

impl TileDescriptor {
    /// Parses a tile message.
    ///
    /// The message must start with `tile ` or `tilecombine` and carry all
    /// four geometry keys (`x`, `y`, `w`, `h`). Unknown keys are ignored so
    /// the grammar can grow without breaking older peers.
    pub fn parse(msg: &str) -> Result<TileDescriptor, Error> {
        if !is_tile_message(msg) {
            return Err(Error::MalformedTileMessage(msg.to_string()));
        }

        let mut x = None;
        let mut y = None;
        let mut width = None;
        let mut height = None;
        let mut version = None;
        let mut id = None;

        // Skip the leading "tile"/"tilecombine" token.
        for token in msg.split_whitespace().skip(1) {
            let Some((key, value)) = token.split_once('=') else {
                return Err(Error::MalformedTileMessage(msg.to_string()));
            };
            match key {
                "x" => x = parse_coord(msg, value)?,
                "y" => y = parse_coord(msg, value)?,
                "w" => width = parse_coord(msg, value)?,
                "h" => height = parse_coord(msg, value)?,
                "ver" => version = value.parse::<u32>().ok(),
                "id" => id = Some(value.to_string()),
                _ => {}
            }
        }

        match (x, y, width, height) {
            (Some(x), Some(y), Some(width), Some(height)) => Ok(TileDescriptor {
                x,
                y,
                width,
                height,
                version,
                id,
            }),
            _ => Err(Error::MalformedTileMessage(msg.to_string())),
        }
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn version(&self) -> Option<u32> {
        self.version
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Whether this tile overlaps the given cursor rectangle.
    ///
    /// Overlap is half-open on both axes; an empty rectangle on either side
    /// never intersects.
    pub fn intersects(&self, rect: &CursorPosition) -> bool {
        if self.width == 0 || self.height == 0 || rect.width == 0 || rect.height == 0 {
            return false;
        }

        // Widen to u64 so x + width cannot wrap.
        let (tx, ty) = (u64::from(self.x), u64::from(self.y));
        let (tw, th) = (u64::from(self.width), u64::from(self.height));
        let (rx, ry) = (u64::from(rect.x), u64::from(rect.y));
        let (rw, rh) = (u64::from(rect.width), u64::from(rect.height));

        tx < rx + rw && rx < tx + tw && ty < ry + rh && ry < ty + th
    }
}

/// Whether the message text is a tile request.
pub fn is_tile_message(msg: &str) -> bool {
    msg.starts_with("tile ") || msg.starts_with("tilecombine")
}

/// The identity of a tile message: the text up to the first `" ver"`
/// occurrence. The version suffix is excluded so a re-request of the same
/// region replaces the stale one instead of queuing behind it.
pub fn tile_identity(msg: &str) -> &str {
    match msg.find(" ver") {
        Some(pos) => &msg[..pos],
        None => msg,
    }
}

fn parse_coord(msg: &str, value: &str) -> Result<Option<u32>, Error> {
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|_| Error::MalformedTileMessage(msg.to_string()))
}
