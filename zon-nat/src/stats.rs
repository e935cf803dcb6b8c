use crate::InfoTable;
use zon_nat_dp::Stats;

pub fn print_all(stats: &Stats, title: &str) {
    let mut sinfo = InfoTable::new(vec!["stat", "count"]);

    for (name, count) in stats.snapshot() {
        sinfo.push_row(vec![name.to_string(), count.to_string()]);
    }

    sinfo.print(title);
}
