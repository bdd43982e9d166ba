mod tests_multi;
