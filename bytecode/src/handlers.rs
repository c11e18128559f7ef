/// One protected range of a function's bytecode.
///
/// Covers offsets `start..end`. When an exception unwinds into the range
/// and its class is assignable to `class` (a raw class-table index, checked
/// by the machine), control transfers to `handler` with the operand stack
/// cleared down to the exception object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRange {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub class: u32,
}

/// The exception-handler table of one function, in source order: inner
/// (more specific) handlers first, so the first covering match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionTable {
    ranges: Vec<HandlerRange>,
}

impl ExceptionTable {
    pub fn from_ranges(ranges: Vec<HandlerRange>) -> Self {
        debug_assert!(
            ranges.iter().all(|r| r.start < r.end),
            "empty handler range"
        );
        Self { ranges }
    }

    /// Handlers whose protected range covers `pc`, in table order.
    pub fn covering(
        &self,
        pc: u32,
    ) -> impl Iterator<Item = &HandlerRange> + '_ {
        self.ranges
            .iter()
            .filter(move |r| r.start <= pc && pc < r.end)
    }

    pub fn ranges(&self) -> &[HandlerRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covering_respects_half_open_ranges_and_order() {
        let table = ExceptionTable::from_ranges(vec![
            HandlerRange { start: 10, end: 20, handler: 50, class: 2 },
            HandlerRange { start: 0, end: 40, handler: 60, class: 1 },
        ]);

        let at = |pc: u32| {
            table.covering(pc).map(|r| r.handler).collect::<Vec<_>>()
        };
        assert_eq!(at(10), vec![50, 60]);
        assert_eq!(at(19), vec![50, 60]);
        assert_eq!(at(20), vec![60]);
        assert_eq!(at(39), vec![60]);
        assert_eq!(at(40), Vec::<u32>::new());
    }
}
